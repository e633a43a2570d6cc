use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    Wgt,
    Tpk,
}

impl PackageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wgt => "wgt",
            Self::Tpk => "tpk",
        }
    }

    pub fn manifest_file_name(self) -> &'static str {
        match self {
            Self::Wgt => "config.toml",
            Self::Tpk => "tizen-manifest.toml",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "wgt" | "widget" => Some(Self::Wgt),
            "tpk" | "native" => Some(Self::Tpk),
            _ => None,
        }
    }

    /// Guesses the package type from an archive extension, falling back to
    /// the manifest found inside an unpacked package directory.
    pub fn infer_from_path(path: &Path) -> Option<Self> {
        if path.is_dir() {
            return [Self::Tpk, Self::Wgt]
                .into_iter()
                .find(|kind| path.join(kind.manifest_file_name()).is_file());
        }

        let extension = path.extension()?.to_str()?;
        Self::parse(extension)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Install,
    Update,
    Uninstall,
    Reinstall,
    Clear,
    Recovery,
    Delta,
    Unknown,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Update => "update",
            Self::Uninstall => "uninstall",
            Self::Reinstall => "reinstall",
            Self::Clear => "clear",
            Self::Recovery => "recovery",
            Self::Delta => "delta",
            Self::Unknown => "unknown",
        }
    }

    /// Requests that replace content of an already installed package.
    pub fn is_upgrading(self) -> bool {
        matches!(self, Self::Update | Self::Reinstall | Self::Clear | Self::Delta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
    #[default]
    User,
    Global,
}

impl RequestMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Global => "global",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "global" => Some(Self::Global),
            _ => None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeLevel {
    #[default]
    Untrusted,
    Public,
    Partner,
    Platform,
}

impl PrivilegeLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untrusted => "untrusted",
            Self::Public => "public",
            Self::Partner => "partner",
            Self::Platform => "platform",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "untrusted" => Some(Self::Untrusted),
            "public" => Some(Self::Public),
            "partner" => Some(Self::Partner),
            "platform" => Some(Self::Platform),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallLocation {
    #[default]
    Auto,
    InternalOnly,
    PreferExternal,
}
