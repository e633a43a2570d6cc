use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use appinst_core::RequestMode;
use tracing::{debug, warn};

use crate::context::StorageLocation;
use crate::fs_utils::{create_dir, remove_all};
use crate::layout::InstallerLayout;

/// Per-user storage directories created for every installed package.
pub const STORAGE_SUBDIRS: [&str; 4] = ["data", "cache", "shared/data", "shared/trusted"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryOperation {
    CreateStorage,
    DeleteStorage,
}

impl DirectoryOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateStorage => "create-storage",
            Self::DeleteStorage => "delete-storage",
        }
    }
}

/// Privileged collaborator that owns per-user application directories.
pub trait DirectoryHelper {
    fn run(
        &self,
        operation: DirectoryOperation,
        pkgid: &str,
        uid: u32,
        mode: RequestMode,
        location: StorageLocation,
    ) -> Result<()>;
}

/// Performs the directory operations directly with the installer's own
/// permissions.
#[derive(Debug, Clone)]
pub struct InProcessHelper {
    layout: InstallerLayout,
}

impl InProcessHelper {
    pub fn new(layout: InstallerLayout) -> Self {
        Self { layout }
    }
}

impl DirectoryHelper for InProcessHelper {
    fn run(
        &self,
        operation: DirectoryOperation,
        pkgid: &str,
        uid: u32,
        _mode: RequestMode,
        _location: StorageLocation,
    ) -> Result<()> {
        let base = self.layout.storage_dir(uid, pkgid);
        match operation {
            DirectoryOperation::CreateStorage => {
                for subdir in STORAGE_SUBDIRS {
                    create_dir(&base.join(subdir))?;
                }
                debug!(pkgid, uid, path = %base.display(), "storage directories created");
                Ok(())
            }
            DirectoryOperation::DeleteStorage => {
                remove_all(&base)?;
                debug!(pkgid, uid, path = %base.display(), "storage directories removed");
                Ok(())
            }
        }
    }
}

/// Runs an external helper as
/// `<program> <operation> <pkgid> <uid> <mode> <location>`, falling back to
/// the in-process implementation when the helper cannot be used.
#[derive(Debug, Clone)]
pub struct SubprocessHelper {
    program: PathBuf,
    fallback: InProcessHelper,
}

impl SubprocessHelper {
    pub fn new(program: &Path, layout: InstallerLayout) -> Self {
        Self {
            program: program.to_path_buf(),
            fallback: InProcessHelper::new(layout),
        }
    }

    fn spawn(
        &self,
        operation: DirectoryOperation,
        pkgid: &str,
        uid: u32,
        mode: RequestMode,
        location: StorageLocation,
    ) -> Result<()> {
        let location = match location {
            StorageLocation::Internal => "internal",
            StorageLocation::External => "external",
        };
        let output = Command::new(&self.program)
            .arg(operation.as_str())
            .arg(pkgid)
            .arg(uid.to_string())
            .arg(mode.as_str())
            .arg(location)
            .output()
            .with_context(|| {
                format!(
                    "directory helper {} failed to start",
                    self.program.display()
                )
            })?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(anyhow!(
            "directory helper {} {}: status={} stderr='{}'",
            self.program.display(),
            operation.as_str(),
            output.status,
            stderr.trim()
        ))
    }
}

impl DirectoryHelper for SubprocessHelper {
    fn run(
        &self,
        operation: DirectoryOperation,
        pkgid: &str,
        uid: u32,
        mode: RequestMode,
        location: StorageLocation,
    ) -> Result<()> {
        match self.spawn(operation, pkgid, uid, mode, location) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(
                    operation = operation.as_str(),
                    pkgid,
                    error = %format!("{err:#}"),
                    "directory helper failed, using in-process fallback"
                );
                self.fallback.run(operation, pkgid, uid, mode, location)
            }
        }
    }
}
