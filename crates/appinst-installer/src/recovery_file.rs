use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use appinst_core::{PackageType, RequestMode, RequestType};
use tracing::{debug, warn};

use crate::fs_utils::unique_suffix;

const RECOVERY_MARKER: &str = "-recovery-";

/// Request kind recorded on the first line of a recovery file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    New,
    Update,
    Uninstall,
    Reinstall,
    Delta,
    Unknown,
}

impl RecoveryKind {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Update => "UPDATE",
            Self::Uninstall => "UNINSTALLATION",
            Self::Reinstall => "RDS",
            Self::Delta => "DELTA",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Unrecognized keywords decode to `Unknown` rather than failing.
    pub fn from_keyword(value: &str) -> Self {
        match value.trim() {
            "NEW" => Self::New,
            "UPDATE" => Self::Update,
            "UNINSTALLATION" => Self::Uninstall,
            "RDS" => Self::Reinstall,
            "DELTA" => Self::Delta,
            _ => Self::Unknown,
        }
    }

    pub fn for_request(request: RequestType) -> Self {
        match request {
            RequestType::Install => Self::New,
            RequestType::Update => Self::Update,
            RequestType::Uninstall => Self::Uninstall,
            RequestType::Reinstall => Self::Reinstall,
            RequestType::Delta => Self::Delta,
            RequestType::Clear | RequestType::Recovery | RequestType::Unknown => Self::Unknown,
        }
    }
}

/// Request mode and uid of the request that created a recovery file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOwner {
    pub mode: RequestMode,
    pub uid: u32,
}

/// Durable three-line crash record:
///
/// ```text
/// <KIND>
/// <unpacked dir or empty>
/// <pkgid or empty>
/// ```
///
/// Every setter rewrites the whole file and syncs it before returning. The
/// file is deleted when the handle drops unless it was detached.
///
/// The owner is not part of the content; it is encoded in the file name as
/// `<pkgtype>-<mode>-<uid>-recovery-<unique>`.
#[derive(Debug)]
pub struct RecoveryFile {
    path: PathBuf,
    kind: RecoveryKind,
    unpacked_dir: Option<PathBuf>,
    pkgid: Option<String>,
    detached: bool,
}

impl RecoveryFile {
    /// Creates `<dir>/<pkgtype>-<mode>-<uid>-recovery-<unique>` for a new
    /// request.
    pub fn create_unique(
        dir: &Path,
        package_type: PackageType,
        owner: RecoveryOwner,
        kind: RecoveryKind,
    ) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create recovery dir: {}", dir.display()))?;
        let name = format!(
            "{}-{}-{}{RECOVERY_MARKER}{}",
            package_type.as_str(),
            owner.mode.as_str(),
            owner.uid,
            unique_suffix()
        );
        Self::create(&dir.join(name), kind)
    }

    pub fn create(path: &Path, kind: RecoveryKind) -> Result<Self> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("failed to create recovery file: {}", path.display()))?;

        let file = Self {
            path: path.to_path_buf(),
            kind,
            unpacked_dir: None,
            pkgid: None,
            detached: false,
        };
        file.commit()?;
        debug!(path = %path.display(), kind = kind.keyword(), "recovery file created");
        Ok(file)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read recovery file: {}", path.display()))?;
        let mut lines = raw.lines();
        let kind = RecoveryKind::from_keyword(lines.next().unwrap_or_default());
        let unpacked_dir = lines
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from);
        let pkgid = lines
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string);

        Ok(Self {
            path: path.to_path_buf(),
            kind,
            unpacked_dir,
            pkgid,
            detached: false,
        })
    }

    /// Package type encoded in the file name by [`RecoveryFile::create_unique`].
    pub fn package_type_from_path(path: &Path) -> Result<PackageType> {
        let (name, prefix) = name_prefix(path)?;
        let package_type = prefix.split('-').next().unwrap_or_default();
        PackageType::parse(package_type)
            .ok_or_else(|| anyhow!("unknown package type in recovery file name: {name}"))
    }

    /// Owner encoded in the file name. `None` for names that carry only the
    /// package type.
    pub fn owner_from_path(path: &Path) -> Result<Option<RecoveryOwner>> {
        let (name, prefix) = name_prefix(path)?;
        let mut parts = prefix.splitn(3, '-').skip(1);
        let (mode, uid) = match (parts.next(), parts.next()) {
            (None, _) => return Ok(None),
            (Some(mode), Some(uid)) => (mode, uid),
            (Some(_), None) => return Err(anyhow!("malformed recovery file name: {name}")),
        };
        let mode = RequestMode::parse(mode)
            .ok_or_else(|| anyhow!("unknown request mode in recovery file name: {name}"))?;
        let uid = uid
            .parse::<u32>()
            .with_context(|| format!("invalid uid in recovery file name: {name}"))?;
        Ok(Some(RecoveryOwner { mode, uid }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> RecoveryKind {
        self.kind
    }

    pub fn unpacked_dir(&self) -> Option<&Path> {
        self.unpacked_dir.as_deref()
    }

    pub fn pkgid(&self) -> Option<&str> {
        self.pkgid.as_deref()
    }

    pub fn set_kind(&mut self, kind: RecoveryKind) -> Result<()> {
        self.kind = kind;
        self.commit()
    }

    pub fn set_unpacked_dir(&mut self, dir: &Path) -> Result<()> {
        self.unpacked_dir = Some(dir.to_path_buf());
        self.commit()
    }

    pub fn set_pkgid(&mut self, pkgid: &str) -> Result<()> {
        self.pkgid = Some(pkgid.to_string());
        self.commit()
    }

    /// Leaves the file on disk when the handle drops.
    pub fn detach(mut self) -> PathBuf {
        self.detached = true;
        self.path.clone()
    }

    pub fn remove(mut self) -> Result<()> {
        self.detached = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("failed to remove recovery file: {}", self.path.display())
            }),
        }
    }

    fn commit(&self) -> Result<()> {
        let unpacked = self
            .unpacked_dir
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        let pkgid = self.pkgid.as_deref().unwrap_or_default();
        let content = format!("{}\n{unpacked}\n{pkgid}\n", self.kind.keyword());

        // Hidden staging name never parses as a recovery file.
        let staging = self.staging_path();
        let written = write_synced(&staging, &content).and_then(|()| {
            fs::rename(&staging, &self.path).with_context(|| {
                format!("failed to replace recovery file: {}", self.path.display())
            })
        });
        if let Err(err) = written {
            let _ = fs::remove_file(&staging);
            return Err(err);
        }
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::File::open(parent).and_then(|dir| dir.sync_all()) {
                warn!(path = %parent.display(), error = %err, "failed to sync recovery dir");
            }
        }
        Ok(())
    }

    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path.with_file_name(format!(".{name}.tmp"))
    }
}

fn name_prefix(path: &Path) -> Result<(&str, &str)> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid recovery file path: {}", path.display()))?;
    let (prefix, _) = name
        .split_once(RECOVERY_MARKER)
        .ok_or_else(|| anyhow!("not a recovery file name: {name}"))?;
    Ok((name, prefix))
}

fn write_synced(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("failed to open recovery file: {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("failed to write recovery file: {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush recovery file: {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync recovery file: {}", path.display()))
}

impl Drop for RecoveryFile {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove recovery file");
            }
        }
    }
}
