use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Context;
use appinst_core::PrivilegeLevel;
use appinst_registry::PackageRegistry;
use appinst_security::{CertificateBundle, SignatureError, SignatureValidator};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::InstallerContext;
use crate::error::{OrStatus, Status, StepError, StepResult};
use crate::fs_utils::{
    backup_path_for, create_dir, discard_stale_backup, move_file, remove_all, restore_backup,
};
use crate::recovery::RecoveryStep;
use crate::services::PrivilegePolicy;
use crate::step::Step;

/// Verifies the package signatures and records the signer level and
/// certificates in the context.
pub struct StepCheckSignature {
    validator: Rc<dyn SignatureValidator>,
    check_reference: bool,
}

impl StepCheckSignature {
    /// `check_reference` also verifies that the signed digest matches the
    /// unpacked content.
    pub fn new(validator: Rc<dyn SignatureValidator>, check_reference: bool) -> Self {
        Self {
            validator,
            check_reference,
        }
    }
}

impl Step for StepCheckSignature {
    fn name(&self) -> &'static str {
        "check-signature"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let unpacked = ctx
            .unpacked_dir
            .as_deref()
            .ok_or_else(|| StepError::new(Status::InvalidValue, "package has not been unpacked"))?;
        let outcome = self
            .validator
            .validate(unpacked, self.check_reference)
            .map_err(|err| StepError::new(signature_status(&err), err.to_string()))?;

        info!(
            level = outcome.privilege_level.as_str(),
            distributors = outcome.certificates.distributors.len(),
            "signature verified"
        );
        ctx.privilege_level = outcome.privilege_level;
        ctx.certificates = outcome.certificates;
        Ok(())
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        ctx.privilege_level = PrivilegeLevel::default();
        ctx.certificates = CertificateBundle::default();
        Ok(())
    }
}

/// Update: the new author certificate must equal the one stored at install
/// time.
pub struct StepCheckOldCertificate {
    registry: Rc<dyn PackageRegistry>,
}

impl StepCheckOldCertificate {
    pub fn new(registry: Rc<dyn PackageRegistry>) -> Self {
        Self { registry }
    }
}

impl Step for StepCheckOldCertificate {
    fn name(&self) -> &'static str {
        "check-old-certificate"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let pkgid = ctx.require_pkgid()?;
        let old = self
            .registry
            .query_certificate(pkgid, ctx.uid)
            .or_status(Status::RegistrationError)?;
        let Some(old) = old else {
            debug!(pkgid, "installed package has no author certificate");
            return Ok(());
        };

        let new = ctx
            .certificates
            .author
            .as_ref()
            .map(|author| author.encoded.as_str());
        if new != Some(old.as_str()) {
            return Err(StepError::new(
                Status::AuthorCertNotMatch,
                format!("author certificate of '{pkgid}' does not match the installed one"),
            ));
        }
        Ok(())
    }
}

/// Rejects manifests declaring privileges above the signer level.
pub struct StepCheckPrivileges {
    policy: Rc<PrivilegePolicy>,
}

impl StepCheckPrivileges {
    pub fn new(policy: Rc<PrivilegePolicy>) -> Self {
        Self { policy }
    }
}

impl Step for StepCheckPrivileges {
    fn name(&self) -> &'static str {
        "check-privileges"
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let manifest = ctx.require_manifest()?;
        for privilege in &manifest.privileges {
            let required = self.policy.required_level(privilege);
            if ctx.privilege_level < required {
                return Err(StepError::new(
                    Status::PrivilegeError,
                    format!(
                        "privilege '{privilege}' requires {} level, package is {}",
                        required.as_str(),
                        ctx.privilege_level.as_str()
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    Install,
    Update,
    Revoke,
}

/// Security policy stored per package and consumed by the platform's
/// access control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub pkgid: String,
    pub privilege_level: PrivilegeLevel,
    #[serde(default)]
    pub privileges: Vec<String>,
    #[serde(default)]
    pub app_ids: Vec<String>,
    pub package_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_fingerprint: Option<String>,
}

/// Installs, replaces or revokes the package's security policy.
#[derive(Debug)]
pub struct StepRegisterSecurity {
    mode: SecurityMode,
    backed_up: bool,
    written: bool,
}

impl StepRegisterSecurity {
    pub fn new(mode: SecurityMode) -> Self {
        Self {
            mode,
            backed_up: false,
            written: false,
        }
    }

    fn write_policy(&mut self, ctx: &InstallerContext, path: &Path) -> StepResult {
        let manifest = ctx.require_manifest()?;
        let policy = SecurityPolicy {
            pkgid: ctx.require_pkgid()?.to_string(),
            privilege_level: ctx.privilege_level,
            privileges: manifest.privileges.clone(),
            app_ids: manifest
                .applications
                .iter()
                .map(|app| app.app_id.clone())
                .collect(),
            package_path: ctx.package_path()?,
            author_fingerprint: ctx
                .certificates
                .author
                .as_ref()
                .map(|author| author.fingerprint.clone()),
        };
        let content = toml::to_string(&policy)
            .context("failed to serialize security policy")
            .or_status(Status::PrivilegeError)?;
        if let Some(parent) = path.parent() {
            create_dir(parent).or_status(Status::PrivilegeError)?;
        }
        self.written = true;
        fs::write(path, content)
            .with_context(|| format!("failed to write security policy: {}", path.display()))
            .or_status(Status::PrivilegeError)
    }
}

impl Step for StepRegisterSecurity {
    fn name(&self) -> &'static str {
        match self.mode {
            SecurityMode::Install => "register-security",
            SecurityMode::Update => "update-security",
            SecurityMode::Revoke => "revoke-security",
        }
    }

    fn process(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let path = ctx
            .layout
            .security_policy_path(ctx.scope(), ctx.require_pkgid()?);
        if self.mode != SecurityMode::Install && path.exists() {
            discard_stale_backup(&path).or_status(Status::PrivilegeError)?;
            move_file(&path, &backup_path_for(&path)).or_status(Status::PrivilegeError)?;
            self.backed_up = true;
        }
        if self.mode != SecurityMode::Revoke {
            self.write_policy(ctx, &path)?;
        }
        debug!(path = %path.display(), mode = ?self.mode, "security policy applied");
        Ok(())
    }

    fn clean(&mut self, ctx: &mut InstallerContext) -> StepResult {
        if !self.backed_up {
            return Ok(());
        }
        let path = ctx
            .layout
            .security_policy_path(ctx.scope(), ctx.require_pkgid()?);
        remove_all(&backup_path_for(&path)).or_status(Status::PrivilegeError)
    }

    fn undo(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let path = ctx
            .layout
            .security_policy_path(ctx.scope(), ctx.require_pkgid()?);
        if self.written {
            remove_all(&path).or_status(Status::PrivilegeError)?;
        }
        if self.backed_up {
            restore_backup(&path).or_status(Status::PrivilegeError)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StepRecoverSecurity;

impl RecoveryStep for StepRecoverSecurity {
    fn name(&self) -> &'static str {
        "recover-security"
    }

    fn recover_new(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let Some(pkgid) = ctx.pkgid() else {
            return Ok(());
        };
        let path = ctx.layout.security_policy_path(ctx.scope(), pkgid);
        remove_all(&path).or_status(Status::RecoveryError)?;
        remove_all(&backup_path_for(&path)).or_status(Status::RecoveryError)
    }

    fn recover_update(&mut self, ctx: &mut InstallerContext) -> StepResult {
        let Some(pkgid) = ctx.pkgid() else {
            return Ok(());
        };
        let path = ctx.layout.security_policy_path(ctx.scope(), pkgid);
        restore_backup(&path).or_status(Status::RecoveryError)?;
        Ok(())
    }
}

fn signature_status(err: &SignatureError) -> Status {
    match err {
        SignatureError::Revoked { .. } => Status::SignatureRevoked,
        SignatureError::PrivilegeNotFound => Status::PrivilegeNotFound,
        _ => Status::SignatureError,
    }
}
