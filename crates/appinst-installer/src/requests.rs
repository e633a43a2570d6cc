use appinst_core::RequestType;

use crate::error::{Status, StepError, StepResult};
use crate::pipeline::AppInstaller;
use crate::recovery::Recovery;
use crate::services::InstallerServices;
use crate::steps::*;

/// Builds the default-observer pipeline for `request`.
pub fn build_pipeline(
    request: RequestType,
    services: &InstallerServices,
) -> Result<AppInstaller, StepError> {
    let mut installer = AppInstaller::new();
    add_request_steps(&mut installer, request, services)?;
    Ok(installer)
}

/// Appends the steps of `request` to `installer`. Package-type differences
/// live inside the steps, so both package types share one step list.
/// `Unknown` yields no steps.
pub fn add_request_steps(
    installer: &mut AppInstaller,
    request: RequestType,
    services: &InstallerServices,
) -> StepResult {
    match request {
        RequestType::Install => add_install_steps(installer, services),
        RequestType::Update => add_update_steps(installer, services, true),
        RequestType::Reinstall => add_update_steps(installer, services, false),
        RequestType::Uninstall => add_uninstall_steps(installer, services),
        RequestType::Clear => add_clear_steps(installer, services),
        RequestType::Recovery => add_recovery_steps(installer, services),
        RequestType::Delta => {
            return Err(StepError::new(
                Status::DeltaError,
                "delta packages are not supported by this installer",
            ));
        }
        RequestType::Unknown => {}
    }
    Ok(())
}

fn add_install_steps(installer: &mut AppInstaller, services: &InstallerServices) {
    installer
        .add_step(StepConfigure)
        .add_step(StepCreateRecoveryFile)
        .add_step(StepUnzip)
        .add_step(StepParseManifest::new(ManifestSource::Package))
        .add_step(StepCheckSignature::new(services.validator.clone(), true))
        .add_step(StepCheckPrivileges::new(services.privileges.clone()))
        .add_step(StepAcquireStorage)
        .add_step(StepCopy::default())
        .add_step(StepCopyTep::default())
        .add_step(StepCreateStorageDirectories::new(services.dir_helper.clone()))
        .add_step(StepCreateIcons::default())
        .add_step(StepGenerateManifest::default())
        .add_step(StepRegisterSecurity::new(SecurityMode::Install))
        .add_step(StepRegisterApplication::new(services.registry.clone()));
}

/// Update and reinstall. Reinstall redeploys trusted content, so it skips
/// the recovery file and the content digest check.
fn add_update_steps(installer: &mut AppInstaller, services: &InstallerServices, update: bool) {
    installer.add_step(StepConfigure);
    if update {
        installer.add_step(StepCreateRecoveryFile);
    }
    installer
        .add_step(StepUnzip)
        .add_step(StepParseManifest::new(ManifestSource::Package))
        .add_step(StepCheckInstalled::new(services.registry.clone()))
        .add_step(StepCheckSignature::new(services.validator.clone(), update))
        .add_step(StepCheckOldCertificate::new(services.registry.clone()))
        .add_step(StepCheckPrivileges::new(services.privileges.clone()))
        .add_step(StepAcquireStorage)
        .add_step(StepBackupManifest::default())
        .add_step(StepBackupIcons::default())
        .add_step(StepCopyBackup::default())
        .add_step(StepCopyTep::default())
        .add_step(StepCreateStorageDirectories::new(services.dir_helper.clone()))
        .add_step(StepCreateIcons::default())
        .add_step(StepGenerateManifest::default())
        .add_step(StepRegisterSecurity::new(SecurityMode::Update))
        .add_step(StepUpdateApplication::new(services.registry.clone()));
}

fn add_uninstall_steps(installer: &mut AppInstaller, services: &InstallerServices) {
    installer
        .add_step(StepConfigure)
        .add_step(StepCheckInstalled::new(services.registry.clone()))
        .add_step(StepParseManifest::new(ManifestSource::Installed))
        .add_step(StepBackupManifest::default())
        .add_step(StepBackupIcons::default())
        .add_step(StepUnregisterApplication::new(services.registry.clone()))
        .add_step(StepRegisterSecurity::new(SecurityMode::Revoke))
        .add_step(StepRemoveStorageDirectories::default())
        .add_step(StepRemoveFiles::default())
        .add_step(StepRemoveManifest);
}

fn add_clear_steps(installer: &mut AppInstaller, services: &InstallerServices) {
    installer
        .add_step(StepConfigure)
        .add_step(StepCheckInstalled::new(services.registry.clone()))
        .add_step(StepParseManifest::new(ManifestSource::Installed))
        .add_step(StepAcquireStorage)
        .add_step(StepClearUserData::default());
}

/// Manifest, icons, security and storage are repaired before the registry so
/// that an update's registration is rebuilt from the restored manifest.
fn add_recovery_steps(installer: &mut AppInstaller, services: &InstallerServices) {
    installer
        .add_step(StepOpenRecoveryFile)
        .add_step(StepConfigure)
        .add_step(StepParseManifest::new(ManifestSource::Recovery))
        .add_step(Recovery(StepRecoverFiles))
        .add_step(Recovery(StepRecoverManifest))
        .add_step(Recovery(StepRecoverIcons))
        .add_step(Recovery(StepRecoverSecurity))
        .add_step(Recovery(StepRecoverStorage::new(services.dir_helper.clone())))
        .add_step(Recovery(StepRecoverApplication::new(services.registry.clone())))
        .add_step(Recovery(StepRemoveTemporaryDirectory));
}
