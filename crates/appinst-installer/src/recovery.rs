use crate::context::InstallerContext;
use crate::error::{Status, StepError, StepResult};
use crate::recovery_file::RecoveryKind;
use crate::step::Step;

/// Repairs the leftovers of one forward step after a crash. Implementations
/// must be idempotent and treat a missing package id or missing artifacts as
/// nothing to do.
pub trait RecoveryStep {
    fn name(&self) -> &'static str;

    /// The interrupted request was a fresh install.
    fn recover_new(&mut self, ctx: &mut InstallerContext) -> StepResult;

    /// The interrupted request was an update of an installed package.
    fn recover_update(&mut self, ctx: &mut InstallerContext) -> StepResult;
}

/// Adapts a [`RecoveryStep`] into a pipeline step that dispatches on the kind
/// recorded in the opened recovery file.
pub struct Recovery<R>(pub R);

impl<R: RecoveryStep> Step for Recovery<R> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let kind = ctx
            .recovery_info
            .as_ref()
            .map(|file| file.kind())
            .ok_or_else(|| StepError::new(Status::RecoveryError, "no recovery file is open"))?;

        match kind {
            RecoveryKind::New => self.0.recover_new(ctx),
            RecoveryKind::Update => self.0.recover_update(ctx),
            other => Err(StepError::new(
                Status::RecoveryError,
                format!("recovery of {} requests is not supported", other.keyword()),
            )),
        }
    }
}
