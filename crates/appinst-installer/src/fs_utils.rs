use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};

const BACKUP_SUFFIX: &str = ".bck";

/// Moves a directory tree. Falls back to copy-then-delete when a rename is
/// not possible (e.g. across filesystems). The destination must not exist.
pub fn move_dir(src: &Path, dst: &Path) -> Result<()> {
    ensure_absent(dst)?;
    if !src.is_dir() {
        bail!("source directory does not exist: {}", src.display());
    }
    create_parent(dst)?;

    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(
                src = %src.display(),
                dst = %dst.display(),
                error = %err,
                "rename failed, falling back to copy"
            );
            if let Err(copy_err) = copy_dir(src, dst) {
                let _ = fs::remove_dir_all(dst);
                return Err(copy_err);
            }
            fs::remove_dir_all(src)
                .with_context(|| format!("failed to remove moved dir: {}", src.display()))
        }
    }
}

/// File counterpart of [`move_dir`], with the same destination guard.
pub fn move_file(src: &Path, dst: &Path) -> Result<()> {
    ensure_absent(dst)?;
    if !src.is_file() {
        bail!("source file does not exist: {}", src.display());
    }
    create_parent(dst)?;

    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(
                src = %src.display(),
                dst = %dst.display(),
                error = %err,
                "rename failed, falling back to copy"
            );
            if let Err(copy_err) = fs::copy(src, dst) {
                let _ = fs::remove_file(dst);
                return Err(copy_err).with_context(|| {
                    format!("failed to copy {} to {}", src.display(), dst.display())
                });
            }
            fs::remove_file(src)
                .with_context(|| format!("failed to remove moved file: {}", src.display()))
        }
    }
}

/// Creates `path` and any missing parents with mode 0755. Returns whether
/// the directory was newly created; an existing directory is not an error.
pub fn create_dir(path: &Path) -> Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }

    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }
    Ok(true)
}

/// Recursive copy that keeps symlinks as symlinks and carries permissions.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    let src_metadata =
        fs::metadata(src).with_context(|| format!("failed to stat {}", src.display()))?;

    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let metadata = fs::symlink_metadata(&src_path)
            .with_context(|| format!("failed to stat {}", src_path.display()))?;
        if metadata.is_dir() {
            copy_dir(&src_path, &dst_path)?;
            continue;
        }

        #[cfg(unix)]
        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&src_path)
                .with_context(|| format!("failed to read symlink {}", src_path.display()))?;
            std::os::unix::fs::symlink(&target, &dst_path).with_context(|| {
                format!(
                    "failed to create symlink {} -> {}",
                    dst_path.display(),
                    target.display()
                )
            })?;
            continue;
        }

        fs::copy(&src_path, &dst_path).with_context(|| {
            format!(
                "failed to copy {} to {}",
                src_path.display(),
                dst_path.display()
            )
        })?;
    }

    if let Err(err) = fs::set_permissions(dst, src_metadata.permissions()) {
        warn!(path = %dst.display(), error = %err, "failed to carry directory permissions");
    }
    Ok(())
}

/// Removes a file, symlink or directory tree. Missing paths are fine.
pub fn remove_all(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()));
        }
    };

    let removed = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.with_context(|| format!("failed to remove {}", path.display()))
}

/// `<path>.bck`, the sibling that holds the previous state during an update.
pub fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(BACKUP_SUFFIX);
    path.with_file_name(name)
}

pub fn is_backup_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(BACKUP_SUFFIX))
}

/// Removes a `.bck` sibling left behind by an earlier request that never
/// got to its clean phase.
pub fn discard_stale_backup(path: &Path) -> Result<()> {
    let backup = backup_path_for(path);
    if fs::symlink_metadata(&backup).is_ok() {
        warn!(path = %backup.display(), "discarding stale backup");
        remove_all(&backup)?;
    }
    Ok(())
}

/// Replaces `path` with its `.bck` sibling if one exists. Returns whether a
/// backup was restored.
pub fn restore_backup(path: &Path) -> Result<bool> {
    let backup = backup_path_for(path);
    let metadata = match fs::symlink_metadata(&backup) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", backup.display()));
        }
    };

    remove_all(path)?;
    if metadata.is_dir() {
        move_dir(&backup, path)?;
    } else {
        move_file(&backup, path)?;
    }
    Ok(true)
}

/// Process-unique name component: pid, wall-clock nanos and a counter.
pub fn unique_suffix() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{nanos}-{seq}", process::id())
}

/// Sets the process umask for the guard's lifetime and restores the previous
/// mask on every exit path.
#[derive(Debug)]
pub struct UmaskGuard {
    previous: libc::mode_t,
}

impl UmaskGuard {
    pub fn set(mask: libc::mode_t) -> Self {
        // SAFETY: umask has no preconditions and cannot fail.
        let previous = unsafe { libc::umask(mask) };
        Self { previous }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        // SAFETY: see `UmaskGuard::set`.
        unsafe {
            libc::umask(self.previous);
        }
    }
}

fn ensure_absent(dst: &Path) -> Result<()> {
    match fs::symlink_metadata(dst) {
        Ok(_) => Err(anyhow!("destination already exists: {}", dst.display())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to stat {}", dst.display())),
    }
}

fn create_parent(dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create parent dir: {}", parent.display()))?;
    }
    Ok(())
}
