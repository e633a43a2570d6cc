mod configuration;
mod filesystem;
mod icons;
mod manifest;
mod recovery;
mod registry;
mod security;
mod storage;

pub use configuration::{StepCheckInstalled, StepConfigure};
pub use filesystem::{
    StepCopy, StepCopyBackup, StepCopyTep, StepRecoverFiles, StepRemoveFiles,
    StepRemoveTemporaryDirectory, StepUnzip,
};
pub use icons::{StepBackupIcons, StepCreateIcons, StepRecoverIcons};
pub use manifest::{
    ManifestSource, StepBackupManifest, StepGenerateManifest, StepParseManifest,
    StepRecoverManifest, StepRemoveManifest,
};
pub use recovery::{StepCreateRecoveryFile, StepOpenRecoveryFile};
pub use registry::{
    StepRecoverApplication, StepRegisterApplication, StepUnregisterApplication,
    StepUpdateApplication,
};
pub use security::{
    SecurityMode, SecurityPolicy, StepCheckOldCertificate, StepCheckPrivileges,
    StepCheckSignature, StepRecoverSecurity, StepRegisterSecurity,
};
pub use storage::{
    StepAcquireStorage, StepClearUserData, StepCreateStorageDirectories, StepRecoverStorage,
    StepRemoveStorageDirectories,
};
