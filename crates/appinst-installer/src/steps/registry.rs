use std::path::PathBuf;
use std::rc::Rc;

use appinst_registry::{PackageRegistry, RegistrationRequest};
use tracing::{info, warn};

use crate::context::InstallerContext;
use crate::error::{OrStatus, Status, StepError, StepResult};
use crate::recovery::RecoveryStep;
use crate::step::Step;

fn registration_request(
    ctx: &InstallerContext,
    manifest_path: PathBuf,
    certificate: Option<String>,
) -> Result<RegistrationRequest, StepError> {
    Ok(RegistrationRequest {
        manifest_path,
        pkgid: ctx.require_pkgid()?.to_string(),
        package_type: ctx.package_type,
        certificate,
        uid: ctx.uid,
        mode: ctx.request_mode,
    })
}

fn author_certificate(ctx: &InstallerContext) -> Option<String> {
    ctx.certificates
        .author
        .as_ref()
        .map(|author| author.encoded.clone())
}

/// Registers the installed manifest in the package database.
pub struct StepRegisterApplication {
    registry: Rc<dyn PackageRegistry>,
    registered: bool,
}

impl StepRegisterApplication {
    pub fn new(registry: Rc<dyn PackageRegistry>) -> Self {
        Self {
            registry,
            registered: false,
        }
    }
}

impl Step for StepRegisterApplication {
    fn name(&self) -> &'static str {
        "register-application"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let request = registration_request(ctx, ctx.manifest_path()?, author_certificate(ctx))?;
        self.registry
            .register(&request)
            .or_status(Status::RegistrationError)?;
        self.registered = true;
        info!(pkgid = %request.pkgid, "application registered");
        Ok(())
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if !self.registered {
            return Ok(());
        }
        self.registry
            .unregister(ctx.require_pkgid()?, ctx.uid, ctx.request_mode)
            .or_status(Status::RegistrationError)?;
        self.registered = false;
        Ok(())
    }
}

/// Points the registration at the new manifest. Undo re-registers from the
/// manifest backup with the previous certificate.
pub struct StepUpdateApplication {
    registry: Rc<dyn PackageRegistry>,
    previous_certificate: Option<Option<String>>,
}

impl StepUpdateApplication {
    pub fn new(registry: Rc<dyn PackageRegistry>) -> Self {
        Self {
            registry,
            previous_certificate: None,
        }
    }
}

impl Step for StepUpdateApplication {
    fn name(&self) -> &'static str {
        "update-application"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let pkgid = ctx.require_pkgid()?;
        let previous = self
            .registry
            .query_certificate(pkgid, ctx.uid)
            .or_status(Status::RegistrationError)?;
        let request = registration_request(ctx, ctx.manifest_path()?, author_certificate(ctx))?;
        self.registry
            .update(&request)
            .or_status(Status::RegistrationError)?;
        self.previous_certificate = Some(previous);
        info!(pkgid = %request.pkgid, "application registration updated");
        Ok(())
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let Some(certificate) = self.previous_certificate.take() else {
            return Ok(());
        };
        let request = registration_request(ctx, ctx.backup_manifest_path()?, certificate)?;
        self.registry
            .update(&request)
            .or_status(Status::RegistrationError)
    }
}

/// Removes the registration. Undo registers again from the manifest backup.
pub struct StepUnregisterApplication {
    registry: Rc<dyn PackageRegistry>,
    previous_certificate: Option<Option<String>>,
}

impl StepUnregisterApplication {
    pub fn new(registry: Rc<dyn PackageRegistry>) -> Self {
        Self {
            registry,
            previous_certificate: None,
        }
    }
}

impl Step for StepUnregisterApplication {
    fn name(&self) -> &'static str {
        "unregister-application"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let pkgid = ctx.require_pkgid()?;
        let previous = self
            .registry
            .query_certificate(pkgid, ctx.uid)
            .or_status(Status::RegistrationError)?;
        self.registry
            .unregister(pkgid, ctx.uid, ctx.request_mode)
            .or_status(Status::RegistrationError)?;
        self.previous_certificate = Some(previous);
        info!(pkgid, "application unregistered");
        Ok(())
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let Some(certificate) = self.previous_certificate.take() else {
            return Ok(());
        };
        let request = registration_request(ctx, ctx.backup_manifest_path()?, certificate)?;
        self.registry
            .register(&request)
            .or_status(Status::RegistrationError)
    }
}

/// Recovery of the package database entry. Runs after the manifest has been
/// recovered.
pub struct StepRecoverApplication {
    registry: Rc<dyn PackageRegistry>,
}

impl StepRecoverApplication {
    pub fn new(registry: Rc<dyn PackageRegistry>) -> Self {
        Self { registry }
    }
}

impl RecoveryStep for StepRecoverApplication {
    fn name(&self) -> &'static str {
        "recover-application"
    }

    fn recover_new(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let Some(pkgid) = ctx.pkgid() else {
            return Ok(());
        };
        let registration = self
            .registry
            .registration(pkgid, ctx.uid)
            .or_status(Status::RecoveryError)?;
        if let Some(registration) = registration {
            self.registry
                .unregister(pkgid, registration.uid, registration.mode)
                .or_status(Status::RecoveryError)?;
            info!(pkgid, "interrupted installation unregistered");
        }
        Ok(())
    }

    fn recover_update(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let Some(pkgid) = ctx.pkgid() else {
            return Ok(());
        };
        let Some(registration) = self
            .registry
            .registration(pkgid, ctx.uid)
            .or_status(Status::RecoveryError)?
        else {
            warn!(pkgid, "updated package is not registered, nothing to restore");
            return Ok(());
        };
        let manifest_path = ctx.manifest_path()?;
        if !manifest_path.is_file() {
            warn!(pkgid, path = %manifest_path.display(), "installed manifest missing");
            return Ok(());
        }

        let mut request = registration_request(ctx, manifest_path, registration.certificate)?;
        request.uid = registration.uid;
        request.mode = registration.mode;
        self.registry
            .update(&request)
            .or_status(Status::RecoveryError)?;
        info!(pkgid, "registration restored from previous manifest");
        Ok(())
    }
}
