use appinst_core::validate_package_id;
use tracing::{debug, info};

use crate::context::InstallerContext;
use crate::error::{OrStatus, Status, StepError, StepResult};
use crate::recovery_file::{RecoveryFile, RecoveryKind, RecoveryOwner};
use crate::step::Step;

/// Creates the recovery file for install and update requests. A successful
/// run deletes it; a crash leaves it behind for the recovery request.
#[derive(Debug, Default)]
pub struct StepCreateRecoveryFile;

impl Step for StepCreateRecoveryFile {
    fn name(&self) -> &'static str {
        "create-recovery-file"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let mut file = RecoveryFile::create_unique(
            &ctx.layout.recovery_dir(),
            ctx.package_type,
            RecoveryOwner {
                mode: ctx.request_mode,
                uid: ctx.uid,
            },
            RecoveryKind::for_request(ctx.request_type),
        )
        .or_status(Status::RecoveryError)?;
        if let Some(pkgid) = ctx.pkgid() {
            file.set_pkgid(pkgid).or_status(Status::RecoveryError)?;
        }
        debug!(path = %file.path().display(), "recovery file ready");
        ctx.recovery_info = Some(file);
        Ok(())
    }

    fn clean(&mut self, ctx: &mut InstallerContext) -> StepResult {
        remove_recovery_file(ctx)
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        remove_recovery_file(ctx)
    }
}

/// Loads the recovery file named by the request and seeds the context with
/// what the interrupted request had recorded. The owner encoded in the file
/// name replaces the request's mode and uid, so this runs before
/// `StepConfigure` fixes the root application path.
#[derive(Debug, Default)]
pub struct StepOpenRecoveryFile;

impl Step for StepOpenRecoveryFile {
    fn name(&self) -> &'static str {
        "open-recovery-file"
    }

    fn precheck(&mut self, ctx: &InstallerContext) -> StepResult {
        if !ctx.file_path.is_file() {
            return Err(StepError::new(
                Status::RecoveryError,
                format!("recovery file not found: {}", ctx.file_path.display()),
            ));
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if let Some(owner) =
            RecoveryFile::owner_from_path(&ctx.file_path).or_status(Status::RecoveryError)?
        {
            if owner.mode != ctx.request_mode || owner.uid != ctx.uid {
                debug!(
                    mode = owner.mode.as_str(),
                    uid = owner.uid,
                    "using owner recorded by the interrupted request"
                );
            }
            ctx.request_mode = owner.mode;
            ctx.uid = owner.uid;
        }
        let file = RecoveryFile::open(&ctx.file_path).or_status(Status::RecoveryError)?;
        if let Some(pkgid) = file.pkgid() {
            validate_package_id(pkgid).or_status(Status::RecoveryError)?;
            ctx.set_pkgid(pkgid)?;
        }
        ctx.unpacked_dir = file.unpacked_dir().map(|dir| dir.to_path_buf());
        info!(
            path = %file.path().display(),
            kind = file.kind().keyword(),
            pkgid = file.pkgid().unwrap_or_default(),
            "recovering interrupted request"
        );
        ctx.recovery_info = Some(file);
        Ok(())
    }

    fn clean(&mut self, ctx: &mut InstallerContext) -> StepResult {
        remove_recovery_file(ctx)
    }

    /// A failed recovery keeps the file so it can be retried.
    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if let Some(file) = ctx.recovery_info.take() {
            file.detach();
        }
        Ok(())
    }
}

fn remove_recovery_file(ctx: &mut InstallerContext) -> StepResult {
    match ctx.recovery_info.take() {
        Some(file) => file.remove().or_status(Status::RecoveryError),
        None => Ok(()),
    }
}
