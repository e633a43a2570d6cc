mod file_registry;
mod types;

pub use file_registry::FileRegistry;
pub use types::{PackageRegistry, Registration, RegistrationRequest, RegistryScope};
