mod config;
mod context;
mod directory_helper;
mod error;
pub mod fs_utils;
mod layout;
mod pipeline;
mod recovery;
mod recovery_file;
mod requests;
mod services;
mod step;
pub mod steps;

pub use config::InstallerConfig;
pub use context::{
    InstallerContext, StorageAllocation, StorageLocation, WidgetData, WIDGET_CONTENT_DIR,
};
pub use directory_helper::{
    DirectoryHelper, DirectoryOperation, InProcessHelper, SubprocessHelper, STORAGE_SUBDIRS,
};
pub use error::{OrStatus, Status, StepError, StepResult};
pub use layout::{default_prefix, InstallerLayout};
pub use pipeline::{AppInstaller, PipelineObserver, RunOutcome, TracingObserver, UNKNOWN_EXIT_CODE};
pub use recovery::{Recovery, RecoveryStep};
pub use recovery_file::{RecoveryFile, RecoveryKind, RecoveryOwner};
pub use requests::{add_request_steps, build_pipeline};
pub use services::{InstallerServices, PrivilegePolicy};
pub use step::Step;

#[cfg(test)]
mod tests;
