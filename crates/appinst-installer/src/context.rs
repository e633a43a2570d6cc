use std::any::Any;
use std::path::{Path, PathBuf};

use appinst_core::{PackageManifest, PackageType, PrivilegeLevel, RequestMode, RequestType};
use appinst_registry::RegistryScope;
use appinst_security::CertificateBundle;

use crate::error::{Status, StepError};
use crate::layout::InstallerLayout;
use crate::recovery_file::RecoveryFile;

/// Widget packages keep their web content below this directory of the
/// package root.
pub const WIDGET_CONTENT_DIR: &str = "res/wgt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageLocation {
    Internal,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAllocation {
    pub location: StorageLocation,
    pub external_dir: Option<PathBuf>,
    /// True when this request created `external_dir`.
    pub created: bool,
}

/// Widget-only state stored in the backend slot of the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetData {
    pub start_file: String,
}

/// Mutable state shared by all steps of one request.
pub struct InstallerContext {
    pub layout: InstallerLayout,
    pub request_type: RequestType,
    pub request_mode: RequestMode,
    pub package_type: PackageType,
    pub uid: u32,
    /// Package archive or directory, or the recovery file for recovery runs.
    pub file_path: PathBuf,
    pub tep_path: Option<PathBuf>,
    pub unpacked_dir: Option<PathBuf>,
    pub manifest: Option<PackageManifest>,
    pub privilege_level: PrivilegeLevel,
    pub certificates: CertificateBundle,
    pub storage: Option<StorageAllocation>,
    pub recovery_info: Option<RecoveryFile>,
    pkgid: Option<String>,
    root_application_path: Option<PathBuf>,
    backend_data: Option<Box<dyn Any>>,
}

impl InstallerContext {
    pub fn new(layout: InstallerLayout, request_type: RequestType, package_type: PackageType) -> Self {
        Self {
            layout,
            request_type,
            request_mode: RequestMode::default(),
            package_type,
            uid: 0,
            file_path: PathBuf::new(),
            tep_path: None,
            unpacked_dir: None,
            manifest: None,
            privilege_level: PrivilegeLevel::default(),
            certificates: CertificateBundle::default(),
            storage: None,
            recovery_info: None,
            pkgid: None,
            root_application_path: None,
            backend_data: None,
        }
    }

    pub fn scope(&self) -> RegistryScope {
        RegistryScope::for_request(self.uid, self.request_mode)
    }

    pub fn pkgid(&self) -> Option<&str> {
        self.pkgid.as_deref()
    }

    pub fn require_pkgid(&self) -> Result<&str, StepError> {
        self.pkgid()
            .ok_or_else(|| StepError::new(Status::InvalidValue, "package id is not known yet"))
    }

    /// Write-once: setting the same value again is a no-op, a different value
    /// is rejected.
    pub fn set_pkgid(&mut self, pkgid: &str) -> Result<(), StepError> {
        match self.pkgid.as_deref() {
            Some(current) if current == pkgid => Ok(()),
            Some(current) => Err(StepError::new(
                Status::InvalidValue,
                format!("package id already set to '{current}', refusing '{pkgid}'"),
            )),
            None => {
                self.pkgid = Some(pkgid.to_string());
                Ok(())
            }
        }
    }

    pub fn root_application_path(&self) -> Option<&Path> {
        self.root_application_path.as_deref()
    }

    pub fn set_root_application_path(&mut self, path: &Path) -> Result<(), StepError> {
        match self.root_application_path.as_deref() {
            Some(current) if current == path => Ok(()),
            Some(current) => Err(StepError::new(
                Status::InvalidValue,
                format!(
                    "root application path already set to {}, refusing {}",
                    current.display(),
                    path.display()
                ),
            )),
            None => {
                self.root_application_path = Some(path.to_path_buf());
                Ok(())
            }
        }
    }

    /// `<root_application_path>/<pkgid>`.
    pub fn package_path(&self) -> Result<PathBuf, StepError> {
        let root = self.root_application_path().ok_or_else(|| {
            StepError::new(Status::InvalidValue, "root application path is not configured")
        })?;
        Ok(root.join(self.require_pkgid()?))
    }

    /// Directory holding the package content, which is below the package
    /// root for widgets.
    pub fn package_content_dir(&self) -> Result<PathBuf, StepError> {
        let package_path = self.package_path()?;
        Ok(match self.package_type {
            PackageType::Tpk => package_path,
            PackageType::Wgt => package_path.join(WIDGET_CONTENT_DIR),
        })
    }

    pub fn manifest_path(&self) -> Result<PathBuf, StepError> {
        Ok(self
            .layout
            .manifests_dir(self.scope())
            .join(format!("{}.toml", self.require_pkgid()?)))
    }

    pub fn backup_manifest_path(&self) -> Result<PathBuf, StepError> {
        Ok(crate::fs_utils::backup_path_for(&self.manifest_path()?))
    }

    /// Per-package icon directory; applications' icons are named after their
    /// application ids inside it.
    pub fn icon_dir(&self) -> Result<PathBuf, StepError> {
        Ok(self.layout.icons_dir(self.scope()).join(self.require_pkgid()?))
    }

    pub fn storage_dir(&self) -> Result<PathBuf, StepError> {
        Ok(self.layout.storage_dir(self.uid, self.require_pkgid()?))
    }

    pub fn require_manifest(&self) -> Result<&PackageManifest, StepError> {
        self.manifest
            .as_ref()
            .ok_or_else(|| StepError::new(Status::ManifestError, "package manifest is not loaded"))
    }

    pub fn set_backend_data<T: Any>(&mut self, data: T) {
        self.backend_data = Some(Box::new(data));
    }

    pub fn backend_data<T: Any>(&self) -> Option<&T> {
        self.backend_data.as_ref()?.downcast_ref::<T>()
    }

    pub fn clear_backend_data(&mut self) {
        self.backend_data = None;
    }
}
