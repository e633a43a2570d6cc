use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use crate::context::InstallerContext;
use crate::error::{OrStatus, Status, StepError, StepResult};
use crate::fs_utils::{
    backup_path_for, copy_dir, create_dir, discard_stale_backup, move_dir, remove_all,
    restore_backup, unique_suffix, UmaskGuard,
};
use crate::recovery::RecoveryStep;
use crate::step::Step;

const UNPACK_UMASK: libc::mode_t = 0o022;
const TEP_DIR: &str = "res/tep";

/// Unpacks the package into a fresh directory below the installer's tmp dir.
/// Directory sources are copied as-is.
#[derive(Debug, Default)]
pub struct StepUnzip;

impl Step for StepUnzip {
    fn name(&self) -> &'static str {
        "unzip"
    }

    fn precheck(&mut self, ctx: &InstallerContext) -> StepResult {
        if !ctx.file_path.exists() {
            return Err(StepError::new(
                Status::PackageNotFound,
                format!("package file not found: {}", ctx.file_path.display()),
            ));
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let dir = ctx
            .layout
            .tmp_dir()
            .join(format!("unpack-{}", unique_suffix()));
        if let Some(recovery) = ctx.recovery_info.as_mut() {
            recovery
                .set_unpacked_dir(&dir)
                .or_status(Status::RecoveryError)?;
        }
        ctx.unpacked_dir = Some(dir.clone());

        let _umask = UmaskGuard::set(UNPACK_UMASK);
        if ctx.file_path.is_dir() {
            copy_dir(&ctx.file_path, &dir).or_status(Status::AppDirError)?;
        } else {
            create_dir(&dir).or_status(Status::AppDirError)?;
            extract_archive(&ctx.file_path, &dir).or_status(Status::Error)?;
        }
        info!(
            source = %ctx.file_path.display(),
            unpacked = %dir.display(),
            "package unpacked"
        );
        Ok(())
    }

    fn clean(&mut self, ctx: &mut InstallerContext) -> StepResult {
        remove_unpacked(ctx)
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        remove_unpacked(ctx)
    }
}

/// Moves the unpacked content to the package path of a fresh install.
#[derive(Debug, Default)]
pub struct StepCopy {
    attempted: bool,
}

impl Step for StepCopy {
    fn name(&self) -> &'static str {
        "copy-files"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let package_path = ctx.package_path()?;
        let content_dir = ctx.package_content_dir()?;
        let unpacked = require_unpacked(ctx)?;
        if package_path.exists() {
            return Err(StepError::new(
                Status::AppDirError,
                format!("package directory already exists: {}", package_path.display()),
            ));
        }

        self.attempted = true;
        move_dir(&unpacked, &content_dir).or_status(Status::AppDirError)?;
        debug!(package_path = %package_path.display(), "package content installed");
        Ok(())
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if !self.attempted {
            return Ok(());
        }
        remove_all(&ctx.package_path()?).or_status(Status::AppDirError)
    }
}

/// Update variant of [`StepCopy`]: the installed package is moved aside to
/// `<package_path>.bck` and replaced by the unpacked content.
#[derive(Debug, Default)]
pub struct StepCopyBackup {
    backed_up: bool,
}

impl Step for StepCopyBackup {
    fn name(&self) -> &'static str {
        "copy-backup"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let package_path = ctx.package_path()?;
        let content_dir = ctx.package_content_dir()?;
        let unpacked = require_unpacked(ctx)?;
        if !package_path.is_dir() {
            return Err(StepError::new(
                Status::AppDirError,
                format!("installed package directory missing: {}", package_path.display()),
            ));
        }

        let backup = backup_path_for(&package_path);
        discard_stale_backup(&package_path).or_status(Status::AppDirError)?;
        move_dir(&package_path, &backup).or_status(Status::AppDirError)?;
        self.backed_up = true;
        move_dir(&unpacked, &content_dir).or_status(Status::AppDirError)?;
        debug!(
            package_path = %package_path.display(),
            backup = %backup.display(),
            "package content replaced"
        );
        Ok(())
    }

    fn clean(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if !self.backed_up {
            return Ok(());
        }
        remove_all(&backup_path_for(&ctx.package_path()?)).or_status(Status::AppDirError)
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if !self.backed_up {
            return Ok(());
        }
        restore_backup(&ctx.package_path()?).or_status(Status::AppDirError)?;
        Ok(())
    }
}

/// Copies the optional TEP expansion file into `<package_path>/res/tep`.
#[derive(Debug, Default)]
pub struct StepCopyTep {
    copied: Option<PathBuf>,
}

impl Step for StepCopyTep {
    fn name(&self) -> &'static str {
        "copy-tep"
    }

    fn precheck(&mut self, ctx: &InstallerContext) -> StepResult {
        match &ctx.tep_path {
            Some(tep) if !tep.is_file() => Err(StepError::new(
                Status::InvalidValue,
                format!("tep file not found: {}", tep.display()),
            )),
            _ => Ok(()),
        }
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let Some(tep) = ctx.tep_path.clone() else {
            return Ok(());
        };
        let file_name = tep.file_name().ok_or_else(|| {
            StepError::new(
                Status::InvalidValue,
                format!("invalid tep path: {}", tep.display()),
            )
        })?;
        let dst = ctx.package_path()?.join(TEP_DIR).join(file_name);
        if let Some(parent) = dst.parent() {
            create_dir(parent).or_status(Status::AppDirError)?;
        }
        self.copied = Some(dst.clone());
        fs::copy(&tep, &dst)
            .with_context(|| format!("failed to copy {} to {}", tep.display(), dst.display()))
            .or_status(Status::AppDirError)?;
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut InstallerContext) -> StepResult {
        match self.copied.take() {
            Some(path) => remove_all(&path).or_status(Status::AppDirError),
            None => Ok(()),
        }
    }
}

/// Uninstall: moves the package directory aside; deleted in clean.
#[derive(Debug, Default)]
pub struct StepRemoveFiles {
    moved: bool,
}

impl Step for StepRemoveFiles {
    fn name(&self) -> &'static str {
        "remove-files"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let package_path = ctx.package_path()?;
        if !package_path.exists() {
            warn!(path = %package_path.display(), "package directory already absent");
            return Ok(());
        }
        discard_stale_backup(&package_path).or_status(Status::AppDirError)?;
        move_dir(&package_path, &backup_path_for(&package_path))
            .or_status(Status::AppDirError)?;
        self.moved = true;
        Ok(())
    }

    fn clean(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if !self.moved {
            return Ok(());
        }
        remove_all(&backup_path_for(&ctx.package_path()?)).or_status(Status::AppDirError)
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if !self.moved {
            return Ok(());
        }
        restore_backup(&ctx.package_path()?).or_status(Status::AppDirError)?;
        Ok(())
    }
}

/// Recovery of the package directory.
#[derive(Debug, Default)]
pub struct StepRecoverFiles;

impl RecoveryStep for StepRecoverFiles {
    fn name(&self) -> &'static str {
        "recover-files"
    }

    fn recover_new(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if ctx.pkgid().is_none() {
            return Ok(());
        }
        let package_path = ctx.package_path()?;
        remove_all(&package_path).or_status(Status::RecoveryError)?;
        remove_all(&backup_path_for(&package_path)).or_status(Status::RecoveryError)
    }

    fn recover_update(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if ctx.pkgid().is_none() {
            return Ok(());
        }
        let package_path = ctx.package_path()?;
        if restore_backup(&package_path).or_status(Status::RecoveryError)? {
            info!(path = %package_path.display(), "previous package content restored");
        }
        Ok(())
    }
}

/// Recovery of the unpack directory recorded in the recovery file.
#[derive(Debug, Default)]
pub struct StepRemoveTemporaryDirectory;

impl StepRemoveTemporaryDirectory {
    fn remove(&self, ctx: &mut InstallerContext) -> StepResult {
        match ctx.unpacked_dir.take() {
            Some(dir) => remove_all(&dir).or_status(Status::RecoveryError),
            None => Ok(()),
        }
    }
}

impl RecoveryStep for StepRemoveTemporaryDirectory {
    fn name(&self) -> &'static str {
        "remove-temporary-directory"
    }

    fn recover_new(&mut self, ctx: &mut InstallerContext) -> StepResult {
        self.remove(ctx)
    }

    fn recover_update(&mut self, ctx: &mut InstallerContext) -> StepResult {
        self.remove(ctx)
    }
}

fn require_unpacked(ctx: &InstallerContext) -> Result<PathBuf, StepError> {
    ctx.unpacked_dir
        .clone()
        .ok_or_else(|| StepError::new(Status::InvalidValue, "package has not been unpacked"))
}

fn remove_unpacked(ctx: &InstallerContext) -> StepResult {
    match &ctx.unpacked_dir {
        Some(dir) => remove_all(dir).or_status(Status::AppDirError),
        None => Ok(()),
    }
}

fn extract_archive(archive: &Path, dst: &Path) -> Result<()> {
    let mut command = Command::new("unzip");
    command.arg("-qq").arg("-o").arg(archive).arg("-d").arg(dst);
    run_command(
        &mut command,
        &format!("failed to extract package archive {}", archive.display()),
    )
}

fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}
