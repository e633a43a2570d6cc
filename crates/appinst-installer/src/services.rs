use std::collections::BTreeMap;
use std::rc::Rc;

use appinst_core::PrivilegeLevel;
use appinst_registry::PackageRegistry;
use appinst_security::SignatureValidator;

use crate::directory_helper::DirectoryHelper;

/// External collaborators shared by the steps of a pipeline.
#[derive(Clone)]
pub struct InstallerServices {
    pub registry: Rc<dyn PackageRegistry>,
    pub validator: Rc<dyn SignatureValidator>,
    pub dir_helper: Rc<dyn DirectoryHelper>,
    pub privileges: Rc<PrivilegePolicy>,
}

/// Minimum signer level needed to declare each privilege. Privileges that
/// are not listed need `Public`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivilegePolicy {
    required: BTreeMap<String, PrivilegeLevel>,
}

impl PrivilegePolicy {
    pub fn new(required: BTreeMap<String, PrivilegeLevel>) -> Self {
        Self { required }
    }

    pub fn required_level(&self, privilege: &str) -> PrivilegeLevel {
        self.required
            .get(privilege)
            .copied()
            .unwrap_or(PrivilegeLevel::Public)
    }
}
