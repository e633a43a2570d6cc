use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};
use appinst_core::PrivilegeLevel;
use appinst_registry::FileRegistry;
use appinst_security::{PolicyValidator, SignaturePolicy};
use serde::{Deserialize, Serialize};

use crate::directory_helper::{DirectoryHelper, InProcessHelper, SubprocessHelper};
use crate::layout::{default_prefix, InstallerLayout};
use crate::services::{InstallerServices, PrivilegePolicy};

/// `config.toml` of the installer. Every field is optional; an absent file
/// means defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerConfig {
    #[serde(default = "config_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_storage: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helper_path: Option<PathBuf>,
    #[serde(default)]
    pub allow_unsigned: bool,
    #[serde(default)]
    pub revoked_keys: BTreeSet<String>,
    /// Distributor key fingerprint to the privilege level it grants.
    #[serde(default)]
    pub distributors: BTreeMap<String, PrivilegeLevel>,
    /// Privilege name to the minimum level needed to declare it.
    #[serde(default)]
    pub privileges: BTreeMap<String, PrivilegeLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_filter: Option<String>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            version: config_version(),
            root: None,
            registry_dir: None,
            external_storage: None,
            helper_path: None,
            allow_unsigned: false,
            revoked_keys: BTreeSet::new(),
            distributors: BTreeMap::new(),
            privileges: BTreeMap::new(),
            log_filter: None,
        }
    }
}

impl InstallerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config =
            toml::from_str::<Self>(content).context("failed parsing installer config")?;
        let expected = config_version();
        if config.version != expected {
            anyhow::bail!(
                "unsupported installer config version {} (expected {})",
                config.version,
                expected
            );
        }
        Ok(config)
    }

    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("failed reading installer config: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("failed loading installer config: {}", path.display()))
    }

    pub fn layout(&self) -> Result<InstallerLayout> {
        let prefix = match &self.root {
            Some(root) => root.clone(),
            None => default_prefix()?,
        };
        let mut layout = InstallerLayout::new(prefix);
        if let Some(dir) = &self.registry_dir {
            layout = layout.with_registry_dir(dir);
        }
        if let Some(dir) = &self.external_storage {
            layout = layout.with_external_root(dir);
        }
        Ok(layout)
    }

    pub fn signature_policy(&self) -> SignaturePolicy {
        SignaturePolicy {
            allow_unsigned: self.allow_unsigned,
            revoked_keys: self
                .revoked_keys
                .iter()
                .map(|key| key.to_ascii_lowercase())
                .collect(),
            distributor_levels: self
                .distributors
                .iter()
                .map(|(fingerprint, level)| (fingerprint.to_ascii_lowercase(), *level))
                .collect(),
        }
    }

    pub fn privilege_policy(&self) -> PrivilegePolicy {
        PrivilegePolicy::new(self.privileges.clone())
    }

    /// Production collaborators backed by files under `layout`.
    pub fn services(&self, layout: &InstallerLayout) -> InstallerServices {
        let dir_helper: Rc<dyn DirectoryHelper> = match &self.helper_path {
            Some(program) => Rc::new(SubprocessHelper::new(program, layout.clone())),
            None => Rc::new(InProcessHelper::new(layout.clone())),
        };
        InstallerServices {
            registry: Rc::new(FileRegistry::new(layout.registry_dir())),
            validator: Rc::new(PolicyValidator::new(self.signature_policy())),
            dir_helper,
            privileges: Rc::new(self.privilege_policy()),
        }
    }
}

fn config_version() -> u32 {
    1
}
