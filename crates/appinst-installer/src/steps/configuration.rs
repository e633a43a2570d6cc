use std::rc::Rc;

use appinst_core::RequestType;
use appinst_registry::PackageRegistry;
use tracing::debug;

use crate::context::InstallerContext;
use crate::error::{OrStatus, Status, StepError, StepResult};
use crate::step::Step;

/// Validates the request inputs and fixes the root application path.
#[derive(Debug, Default)]
pub struct StepConfigure;

impl Step for StepConfigure {
    fn name(&self) -> &'static str {
        "configure"
    }

    fn precheck(&mut self, ctx: &InstallerContext) -> StepResult {
        match ctx.request_type {
            RequestType::Install
            | RequestType::Update
            | RequestType::Reinstall
            | RequestType::Delta => {
                if !ctx.file_path.exists() {
                    return Err(StepError::new(
                        Status::PackageNotFound,
                        format!("package file not found: {}", ctx.file_path.display()),
                    ));
                }
            }
            RequestType::Uninstall | RequestType::Clear => {
                ctx.require_pkgid()?;
            }
            RequestType::Recovery => {
                if !ctx.file_path.is_file() {
                    return Err(StepError::new(
                        Status::RecoveryError,
                        format!("recovery file not found: {}", ctx.file_path.display()),
                    ));
                }
            }
            RequestType::Unknown => {
                return Err(StepError::new(Status::InvalidValue, "unknown request type"));
            }
        }

        if let Some(tep) = &ctx.tep_path {
            if !tep.is_file() {
                return Err(StepError::new(
                    Status::InvalidValue,
                    format!("tep file not found: {}", tep.display()),
                ));
            }
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let scope = ctx.scope();
        ctx.layout
            .ensure_base_dirs(scope)
            .or_status(Status::AppDirError)?;
        let root = ctx.layout.apps_root(scope);
        ctx.set_root_application_path(&root)?;
        debug!(
            request = ctx.request_type.as_str(),
            package_type = ctx.package_type.as_str(),
            uid = ctx.uid,
            mode = ctx.request_mode.as_str(),
            root = %root.display(),
            "request configured"
        );
        Ok(())
    }
}

/// Fails with `PackageNotFound` unless the package is registered. Checked in
/// precheck when the package id is already known, otherwise in process.
pub struct StepCheckInstalled {
    registry: Rc<dyn PackageRegistry>,
    checked: bool,
}

impl StepCheckInstalled {
    pub fn new(registry: Rc<dyn PackageRegistry>) -> Self {
        Self {
            registry,
            checked: false,
        }
    }

    fn check(&mut self, ctx: &InstallerContext, pkgid: &str) -> StepResult {
        let installed = self
            .registry
            .is_installed(pkgid, ctx.uid)
            .or_status(Status::RegistrationError)?;
        if !installed {
            return Err(StepError::new(
                Status::PackageNotFound,
                format!("package '{pkgid}' is not installed"),
            ));
        }
        self.checked = true;
        Ok(())
    }
}

impl Step for StepCheckInstalled {
    fn name(&self) -> &'static str {
        "check-installed"
    }

    fn precheck(&mut self, ctx: &InstallerContext) -> StepResult {
        match ctx.pkgid() {
            Some(pkgid) => self.check(ctx, pkgid),
            None => Ok(()),
        }
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if self.checked {
            return Ok(());
        }
        let pkgid = ctx.require_pkgid()?.to_string();
        self.check(ctx, &pkgid)
    }
}
