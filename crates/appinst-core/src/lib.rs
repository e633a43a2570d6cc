mod manifest;
mod package;

pub use manifest::{validate_package_id, ApplicationEntry, PackageManifest, WidgetSettings};
pub use package::{InstallLocation, PackageType, PrivilegeLevel, RequestMode, RequestType};
