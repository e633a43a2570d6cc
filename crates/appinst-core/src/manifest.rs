use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path};

use anyhow::{anyhow, Context};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::package::InstallLocation;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageManifest {
    pub package: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub install_location: InstallLocation,
    #[serde(default)]
    pub privileges: Vec<String>,
    #[serde(default)]
    pub applications: Vec<ApplicationEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget: Option<WidgetSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplicationEntry {
    pub app_id: String,
    pub exec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WidgetSettings {
    pub start_file: String,
}

impl PackageManifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse package manifest")?;
        validate_package_id(&manifest.package)?;

        let mut seen_app_ids = HashSet::new();
        for app in &manifest.applications {
            if app.app_id.trim().is_empty() {
                return Err(anyhow!(
                    "application id must not be empty in package '{}'",
                    manifest.package
                ));
            }
            if !seen_app_ids.insert(app.app_id.clone()) {
                return Err(anyhow!(
                    "duplicate application declaration '{}' in package '{}'",
                    app.app_id,
                    manifest.package
                ));
            }
            if let Some(icon) = &app.icon {
                validate_relative_path(icon).with_context(|| {
                    format!("invalid icon path for application '{}'", app.app_id)
                })?;
            }
        }
        if let Some(widget) = &manifest.widget {
            validate_relative_path(&widget.start_file)
                .context("invalid widget start file path")?;
        }
        Ok(manifest)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read package manifest: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("failed to load package manifest: {}", path.display()))
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string(self).context("failed to serialize package manifest")
    }

    pub fn icon_entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.applications
            .iter()
            .filter_map(|app| app.icon.as_deref().map(|icon| (app.app_id.as_str(), icon)))
    }
}

pub fn validate_package_id(pkgid: &str) -> anyhow::Result<()> {
    if pkgid.is_empty() || pkgid.len() > 255 {
        return Err(anyhow!("invalid package id: must be 1-255 characters"));
    }
    if pkgid.starts_with('.') {
        return Err(anyhow!("invalid package id '{pkgid}': must not start with '.'"));
    }
    if pkgid
        .chars()
        .any(|ch| !(ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-'))
    {
        return Err(anyhow!(
            "invalid package id '{pkgid}': only ASCII letters, digits, '.', '_' and '-' are allowed"
        ));
    }
    Ok(())
}

fn validate_relative_path(value: &str) -> anyhow::Result<()> {
    let path = Path::new(value);
    if value.trim().is_empty() || path.is_absolute() {
        return Err(anyhow!("path must be relative and non-empty: {value}"));
    }
    if path
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
    {
        return Err(anyhow!("path must stay inside the package: {value}"));
    }
    Ok(())
}
