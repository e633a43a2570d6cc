use std::path::PathBuf;

use anyhow::Result;
use appinst_core::{PackageType, RequestMode};
use serde::{Deserialize, Serialize};

/// Registration input. The manifest at `manifest_path` is parsed at call
/// time; only its contents are recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub manifest_path: PathBuf,
    pub pkgid: String,
    pub package_type: PackageType,
    pub certificate: Option<String>,
    pub uid: u32,
    pub mode: RequestMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub pkgid: String,
    pub version: String,
    pub package_type: PackageType,
    #[serde(default)]
    pub app_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    pub mode: RequestMode,
    pub uid: u32,
    pub registered_at_unix: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryScope {
    Global,
    User(u32),
}

impl RegistryScope {
    pub fn for_request(uid: u32, mode: RequestMode) -> Self {
        match mode {
            RequestMode::Global => Self::Global,
            RequestMode::User => Self::User(uid),
        }
    }

    pub fn dir_name(self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::User(uid) => format!("user-{uid}"),
        }
    }
}

/// Package database owned by the platform. Every call either fully succeeds
/// or leaves the database untouched.
pub trait PackageRegistry {
    fn register(&self, request: &RegistrationRequest) -> Result<()>;

    fn update(&self, request: &RegistrationRequest) -> Result<()>;

    fn unregister(&self, pkgid: &str, uid: u32, mode: RequestMode) -> Result<()>;

    /// Looks up the uid's own record first, then the global one.
    fn registration(&self, pkgid: &str, uid: u32) -> Result<Option<Registration>>;

    fn is_installed(&self, pkgid: &str, uid: u32) -> Result<bool> {
        Ok(self.registration(pkgid, uid)?.is_some())
    }

    fn query_certificate(&self, pkgid: &str, uid: u32) -> Result<Option<String>> {
        Ok(self
            .registration(pkgid, uid)?
            .and_then(|registration| registration.certificate))
    }
}
