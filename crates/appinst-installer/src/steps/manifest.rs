use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use appinst_core::{PackageManifest, PackageType};
use tracing::{debug, warn};

use crate::context::{InstallerContext, WidgetData};
use crate::error::{OrStatus, Status, StepError, StepResult};
use crate::fs_utils::{create_dir, discard_stale_backup, remove_all, restore_backup};
use crate::recovery::RecoveryStep;
use crate::step::Step;

const DEFAULT_WIDGET_START_FILE: &str = "index.html";

/// Where [`StepParseManifest`] reads the manifest from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestSource {
    /// The unpacked package being installed.
    Package,
    /// The manifest of the installed package.
    Installed,
    /// First existing of: backup manifest, manifest inside the package
    /// directory, installed manifest. Nothing found is not an error.
    Recovery,
}

/// Loads the manifest and fixes the package id for the rest of the request.
#[derive(Debug)]
pub struct StepParseManifest {
    source: ManifestSource,
}

impl StepParseManifest {
    pub fn new(source: ManifestSource) -> Self {
        Self { source }
    }

    fn recovery_manifest(ctx: &InstallerContext) -> Result<Option<PackageManifest>, StepError> {
        if ctx.pkgid().is_none() {
            return Ok(None);
        }
        let in_package = ctx
            .package_content_dir()?
            .join(ctx.package_type.manifest_file_name());
        for candidate in [ctx.backup_manifest_path()?, in_package, ctx.manifest_path()?] {
            if !candidate.is_file() {
                continue;
            }
            match PackageManifest::from_path(&candidate) {
                Ok(manifest) => {
                    debug!(path = %candidate.display(), "recovery manifest selected");
                    return Ok(Some(manifest));
                }
                Err(err) => {
                    warn!(path = %candidate.display(), error = %format!("{err:#}"), "skipping unreadable manifest");
                }
            }
        }
        Ok(None)
    }

    fn load(&self, ctx: &InstallerContext) -> Result<Option<PackageManifest>, StepError> {
        let path = match self.source {
            ManifestSource::Package => ctx
                .unpacked_dir
                .as_ref()
                .ok_or_else(|| {
                    StepError::new(Status::InvalidValue, "package has not been unpacked")
                })?
                .join(ctx.package_type.manifest_file_name()),
            ManifestSource::Installed => ctx.manifest_path()?,
            ManifestSource::Recovery => return Self::recovery_manifest(ctx),
        };
        if !path.is_file() {
            return Err(StepError::new(
                Status::ManifestNotFound,
                format!("manifest not found: {}", path.display()),
            ));
        }
        PackageManifest::from_path(&path)
            .or_status(Status::ManifestError)
            .map(Some)
    }
}

impl Step for StepParseManifest {
    fn name(&self) -> &'static str {
        "parse-manifest"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let Some(manifest) = self.load(ctx)? else {
            debug!("no manifest available for recovery");
            return Ok(());
        };

        ctx.set_pkgid(&manifest.package)?;
        if self.source == ManifestSource::Package {
            if let Some(recovery) = ctx.recovery_info.as_mut() {
                recovery
                    .set_pkgid(&manifest.package)
                    .or_status(Status::RecoveryError)?;
            }
        }

        if ctx.package_type == PackageType::Wgt {
            let start_file = manifest
                .widget
                .as_ref()
                .map(|widget| widget.start_file.clone())
                .unwrap_or_else(|| DEFAULT_WIDGET_START_FILE.to_string());
            if self.source == ManifestSource::Package {
                let unpacked = ctx.unpacked_dir.as_deref().unwrap_or(&ctx.file_path);
                if !unpacked.join(&start_file).is_file() {
                    return Err(StepError::new(
                        Status::ManifestError,
                        format!("widget start file not found: {start_file}"),
                    ));
                }
            }
            ctx.set_backend_data(WidgetData { start_file });
        }

        debug!(
            pkgid = %manifest.package,
            version = %manifest.version,
            apps = manifest.applications.len(),
            "manifest parsed"
        );
        ctx.manifest = Some(manifest);
        Ok(())
    }
}

/// Copies the installed manifest to its `.bck` sibling.
#[derive(Debug, Default)]
pub struct StepBackupManifest {
    backed_up: bool,
}

impl Step for StepBackupManifest {
    fn name(&self) -> &'static str {
        "backup-manifest"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let installed = ctx.manifest_path()?;
        let backup = ctx.backup_manifest_path()?;
        if !installed.is_file() {
            return Err(StepError::new(
                Status::ManifestNotFound,
                format!("installed manifest not found: {}", installed.display()),
            ));
        }
        discard_stale_backup(&installed).or_status(Status::AppDirError)?;

        let copied = fs::copy(&installed, &backup).with_context(|| {
            format!(
                "failed to copy {} to {}",
                installed.display(),
                backup.display()
            )
        });
        if copied.is_err() {
            let _ = remove_all(&backup);
        }
        copied.or_status(Status::AppDirError)?;
        self.backed_up = true;
        Ok(())
    }

    fn clean(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if !self.backed_up {
            return Ok(());
        }
        remove_all(&ctx.backup_manifest_path()?).or_status(Status::AppDirError)
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if !self.backed_up {
            return Ok(());
        }
        restore_backup(&ctx.manifest_path()?).or_status(Status::AppDirError)?;
        Ok(())
    }
}

/// Writes the parsed manifest to the installed manifest location.
#[derive(Debug, Default)]
pub struct StepGenerateManifest {
    written: Option<PathBuf>,
}

impl Step for StepGenerateManifest {
    fn name(&self) -> &'static str {
        "generate-manifest"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let path = ctx.manifest_path()?;
        let content = ctx
            .require_manifest()?
            .to_toml_string()
            .or_status(Status::ManifestError)?;
        if !ctx.request_type.is_upgrading() && path.exists() {
            return Err(StepError::new(
                Status::AppDirError,
                format!("installed manifest already exists: {}", path.display()),
            ));
        }
        if let Some(parent) = path.parent() {
            create_dir(parent).or_status(Status::AppDirError)?;
        }

        let staged = path.with_extension("toml.tmp");
        self.written = Some(path.clone());
        fs::write(&staged, content)
            .with_context(|| format!("failed to write manifest: {}", staged.display()))
            .or_status(Status::AppDirError)?;
        fs::rename(&staged, &path)
            .with_context(|| format!("failed to commit manifest: {}", path.display()))
            .or_status(Status::AppDirError)?;
        debug!(path = %path.display(), "manifest generated");
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut InstallerContext) -> StepResult {
        let Some(path) = self.written.take() else {
            return Ok(());
        };
        remove_all(&path.with_extension("toml.tmp")).or_status(Status::AppDirError)?;
        remove_all(&path).or_status(Status::AppDirError)
    }
}

/// Uninstall: removes the installed manifest. Pair with
/// [`StepBackupManifest`], whose undo brings the file back.
#[derive(Debug, Default)]
pub struct StepRemoveManifest;

impl Step for StepRemoveManifest {
    fn name(&self) -> &'static str {
        "remove-manifest"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        remove_all(&ctx.manifest_path()?).or_status(Status::AppDirError)
    }
}

/// Recovery of the installed manifest and its backup.
#[derive(Debug, Default)]
pub struct StepRecoverManifest;

impl RecoveryStep for StepRecoverManifest {
    fn name(&self) -> &'static str {
        "recover-manifest"
    }

    fn recover_new(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if ctx.pkgid().is_none() {
            return Ok(());
        }
        remove_all(&ctx.manifest_path()?).or_status(Status::RecoveryError)?;
        remove_all(&ctx.backup_manifest_path()?).or_status(Status::RecoveryError)
    }

    fn recover_update(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if ctx.pkgid().is_none() {
            return Ok(());
        }
        restore_backup(&ctx.manifest_path()?).or_status(Status::RecoveryError)?;
        Ok(())
    }
}
