use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use appinst_core::{validate_package_id, PackageManifest, RequestMode};
use tracing::debug;

use crate::types::{PackageRegistry, Registration, RegistrationRequest, RegistryScope};

#[derive(Debug, Clone)]
pub struct FileRegistry {
    root: PathBuf,
}

impl FileRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, scope: RegistryScope, pkgid: &str) -> PathBuf {
        self.root
            .join(scope.dir_name())
            .join(format!("{pkgid}.toml"))
    }

    fn read_record(&self, scope: RegistryScope, pkgid: &str) -> Result<Option<Registration>> {
        let path = self.record_path(scope, pkgid);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed reading registry record: {}", path.display())
                });
            }
        };
        let record = toml::from_str::<Registration>(&raw)
            .with_context(|| format!("failed parsing registry record: {}", path.display()))?;
        Ok(Some(record))
    }

    fn write_record(&self, scope: RegistryScope, record: &Registration) -> Result<()> {
        let path = self.record_path(scope, &record.pkgid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating registry dir: {}", parent.display()))?;
        }

        let content = toml::to_string(record)
            .with_context(|| format!("failed serializing registry record: {}", path.display()))?;
        let staged = path.with_extension("toml.tmp");
        fs::write(&staged, content)
            .with_context(|| format!("failed writing registry record: {}", staged.display()))?;
        fs::rename(&staged, &path)
            .with_context(|| format!("failed committing registry record: {}", path.display()))
    }

    fn build_record(&self, request: &RegistrationRequest) -> Result<Registration> {
        validate_package_id(&request.pkgid)?;
        let manifest = PackageManifest::from_path(&request.manifest_path)?;
        if manifest.package != request.pkgid {
            anyhow::bail!(
                "manifest {} declares package '{}', expected '{}'",
                request.manifest_path.display(),
                manifest.package,
                request.pkgid
            );
        }

        Ok(Registration {
            pkgid: request.pkgid.clone(),
            version: manifest.version.to_string(),
            package_type: request.package_type,
            app_ids: manifest
                .applications
                .iter()
                .map(|app| app.app_id.clone())
                .collect(),
            certificate: request.certificate.clone(),
            mode: request.mode,
            uid: request.uid,
            registered_at_unix: current_unix_timestamp()?,
        })
    }
}

impl PackageRegistry for FileRegistry {
    fn register(&self, request: &RegistrationRequest) -> Result<()> {
        let scope = RegistryScope::for_request(request.uid, request.mode);
        if self.read_record(scope, &request.pkgid)?.is_some() {
            anyhow::bail!(
                "package '{}' is already registered ({})",
                request.pkgid,
                scope.dir_name()
            );
        }

        let record = self.build_record(request)?;
        self.write_record(scope, &record)?;
        debug!(pkgid = %record.pkgid, version = %record.version, "package registered");
        Ok(())
    }

    fn update(&self, request: &RegistrationRequest) -> Result<()> {
        let scope = RegistryScope::for_request(request.uid, request.mode);
        if self.read_record(scope, &request.pkgid)?.is_none() {
            anyhow::bail!(
                "package '{}' is not registered ({})",
                request.pkgid,
                scope.dir_name()
            );
        }

        let record = self.build_record(request)?;
        self.write_record(scope, &record)?;
        debug!(pkgid = %record.pkgid, version = %record.version, "package registration updated");
        Ok(())
    }

    fn unregister(&self, pkgid: &str, uid: u32, mode: RequestMode) -> Result<()> {
        let scope = RegistryScope::for_request(uid, mode);
        let path = self.record_path(scope, pkgid);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(pkgid, "package unregistered");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                anyhow::bail!("package '{}' is not registered ({})", pkgid, scope.dir_name())
            }
            Err(err) => Err(err)
                .with_context(|| format!("failed removing registry record: {}", path.display())),
        }
    }

    fn registration(&self, pkgid: &str, uid: u32) -> Result<Option<Registration>> {
        if let Some(record) = self.read_record(RegistryScope::User(uid), pkgid)? {
            return Ok(Some(record));
        }
        self.read_record(RegistryScope::Global, pkgid)
    }
}

fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}
