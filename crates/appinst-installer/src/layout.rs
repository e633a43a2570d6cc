use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use appinst_registry::RegistryScope;

use crate::fs_utils::create_dir;

/// Filesystem layout rooted at one installer prefix. Every path the steps
/// touch is derived from here rather than from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerLayout {
    prefix: PathBuf,
    registry_dir: Option<PathBuf>,
    external_root: Option<PathBuf>,
}

impl InstallerLayout {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            registry_dir: None,
            external_root: None,
        }
    }

    pub fn with_registry_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.registry_dir = Some(dir.into());
        self
    }

    pub fn with_external_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.external_root = Some(dir.into());
        self
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn apps_root(&self, scope: RegistryScope) -> PathBuf {
        self.prefix.join("apps").join(scope.dir_name())
    }

    pub fn manifests_dir(&self, scope: RegistryScope) -> PathBuf {
        self.prefix.join("manifests").join(scope.dir_name())
    }

    pub fn icons_dir(&self, scope: RegistryScope) -> PathBuf {
        self.prefix.join("icons").join(scope.dir_name())
    }

    pub fn security_dir(&self, scope: RegistryScope) -> PathBuf {
        self.prefix.join("security").join(scope.dir_name())
    }

    pub fn security_policy_path(&self, scope: RegistryScope, pkgid: &str) -> PathBuf {
        self.security_dir(scope).join(format!("{pkgid}.policy"))
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.registry_dir
            .clone()
            .unwrap_or_else(|| self.prefix.join("db"))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.prefix.join("state")
    }

    pub fn recovery_dir(&self) -> PathBuf {
        self.state_dir().join("recovery")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.state_dir().join("tmp")
    }

    pub fn user_home(&self, uid: u32) -> PathBuf {
        self.prefix.join("home").join(uid.to_string())
    }

    pub fn storage_dir(&self, uid: u32, pkgid: &str) -> PathBuf {
        self.user_home(uid).join("apps").join(pkgid)
    }

    pub fn external_root(&self) -> Option<&Path> {
        self.external_root.as_deref()
    }

    pub fn external_dir(&self, uid: u32, pkgid: &str) -> Option<PathBuf> {
        self.external_root
            .as_ref()
            .map(|root| root.join(uid.to_string()).join(pkgid))
    }

    pub fn ensure_base_dirs(&self, scope: RegistryScope) -> Result<()> {
        for dir in [
            self.apps_root(scope),
            self.manifests_dir(scope),
            self.icons_dir(scope),
            self.security_dir(scope),
            self.registry_dir(),
            self.recovery_dir(),
            self.tmp_dir(),
        ] {
            create_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// `$APPINST_ROOT` when set, otherwise `~/.appinst`.
pub fn default_prefix() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os("APPINST_ROOT") {
        return Ok(PathBuf::from(root));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve installer prefix")?;
    Ok(PathBuf::from(home).join(".appinst"))
}
