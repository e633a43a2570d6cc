use crate::context::InstallerContext;
use crate::error::StepResult;

/// One unit of an install/update/uninstall pipeline.
///
/// `precheck` runs for every step before any step's `process`, and must not
/// touch the filesystem or the registry. `undo` reverts only the effects of
/// this step's own `process` and must tolerate partial progress. `clean`
/// discards backups after the whole pipeline succeeded; its failures are
/// logged and ignored.
pub trait Step {
    fn name(&self) -> &'static str;

    fn precheck(&mut self, _ctx: &InstallerContext) -> StepResult {
        Ok(())
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult;

    fn clean(&mut self, _ctx: &mut InstallerContext) -> StepResult {
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut InstallerContext) -> StepResult {
        Ok(())
    }
}
