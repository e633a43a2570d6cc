use appinst_core::RequestType;
use tracing::{debug, error, info, warn};

use crate::context::InstallerContext;
use crate::error::{Status, StepError};
use crate::step::Step;

/// Exit code reported when a pipeline had nothing to run.
pub const UNKNOWN_EXIT_CODE: i32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Ok,
    Error,
    /// The pipeline was empty.
    Unknown,
}

/// Progress sink for the package manager front-end.
pub trait PipelineObserver {
    fn started(&mut self, _request: RequestType, _total_steps: usize) {}

    fn step_finished(&mut self, _step: &str, _completed: usize, _total_steps: usize) {}

    fn finished(&mut self, _outcome: RunOutcome, _error: Option<&StepError>) {}
}

/// Observer that only emits tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn step_finished(&mut self, step: &str, completed: usize, total_steps: usize) {
        debug!(step, completed, total_steps, "step finished");
    }
}

/// Ordered list of steps run as one transaction.
pub struct AppInstaller {
    steps: Vec<Box<dyn Step>>,
    observer: Box<dyn PipelineObserver>,
    last_error: Option<StepError>,
}

impl Default for AppInstaller {
    fn default() -> Self {
        Self::new()
    }
}

impl AppInstaller {
    pub fn new() -> Self {
        Self::with_observer(Box::new(TracingObserver))
    }

    pub fn with_observer(observer: Box<dyn PipelineObserver>) -> Self {
        Self {
            steps: Vec::new(),
            observer,
            last_error: None,
        }
    }

    pub fn add_step<S: Step + 'static>(&mut self, step: S) -> &mut Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    pub fn last_error(&self) -> Option<&StepError> {
        self.last_error.as_ref()
    }

    pub fn exit_code(&self, outcome: RunOutcome) -> i32 {
        match outcome {
            RunOutcome::Ok => Status::Ok.exit_code(),
            RunOutcome::Error => self
                .last_error
                .as_ref()
                .map_or(Status::Error, |err| err.status)
                .exit_code(),
            RunOutcome::Unknown => UNKNOWN_EXIT_CODE,
        }
    }

    /// Runs every precheck, then every process in order. A failure rolls back
    /// the failing step and every step before it, most recent first. On
    /// success every step is cleaned in forward order.
    pub fn run(&mut self, ctx: &mut InstallerContext) -> RunOutcome {
        self.last_error = None;
        let total = self.steps.len();
        self.observer.started(ctx.request_type, total);
        if total == 0 {
            warn!(request = ctx.request_type.as_str(), "pipeline has no steps");
            self.observer.finished(RunOutcome::Unknown, None);
            return RunOutcome::Unknown;
        }
        info!(request = ctx.request_type.as_str(), steps = total, "pipeline started");

        let mut precheck_failure = None;
        for step in &mut self.steps {
            if let Err(err) = step.precheck(ctx) {
                error!(step = step.name(), error = %err, "precheck failed");
                precheck_failure = Some(err);
                break;
            }
        }
        if let Some(err) = precheck_failure {
            return self.fail(err);
        }

        for index in 0..total {
            let step = &mut self.steps[index];
            debug!(step = step.name(), "processing");
            if let Err(err) = step.process(ctx) {
                error!(step = step.name(), error = %err, "step failed, rolling back");
                self.rollback(index, ctx);
                return self.fail(err);
            }
            self.observer.step_finished(step.name(), index + 1, total);
        }

        for step in &mut self.steps {
            if let Err(err) = step.clean(ctx) {
                warn!(step = step.name(), error = %err, "clean failed");
            }
        }

        info!(request = ctx.request_type.as_str(), "pipeline finished");
        self.observer.finished(RunOutcome::Ok, None);
        RunOutcome::Ok
    }

    /// Undoes the failed step, which may have left partial effects, then
    /// every step before it in reverse. Undo failures are logged and do not
    /// stop the remaining undos.
    fn rollback(&mut self, failed: usize, ctx: &mut InstallerContext) {
        for step in self.steps[..=failed].iter_mut().rev() {
            debug!(step = step.name(), "undoing");
            if let Err(err) = step.undo(ctx) {
                error!(step = step.name(), error = %err, "undo failed");
            }
        }
    }

    fn fail(&mut self, err: StepError) -> RunOutcome {
        self.observer.finished(RunOutcome::Error, Some(&err));
        self.last_error = Some(err);
        RunOutcome::Error
    }
}
