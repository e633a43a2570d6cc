use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::validator::SIGNATURE_FILE_NAME;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_hex_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];
    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// One `"<sha256>  <relpath>"` line per regular file below `base`, sorted by
/// path. The signature file itself is excluded.
pub fn reference_lines(base: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    collect_files(base, base, &mut files)?;
    files.sort();

    let mut lines = Vec::with_capacity(files.len());
    for rel in files {
        let rel_display = rel
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if rel_display == SIGNATURE_FILE_NAME {
            continue;
        }
        let digest = sha256_hex_file(&base.join(&rel))?;
        lines.push(format!("{digest}  {rel_display}"));
    }
    Ok(lines)
}

pub fn reference_digest(base: &Path) -> Result<String> {
    let mut payload = String::new();
    for line in reference_lines(base)? {
        payload.push_str(&line);
        payload.push('\n');
    }
    Ok(sha256_hex(payload.as_bytes()))
}

fn collect_files(root: &Path, current: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in
        fs::read_dir(current).with_context(|| format!("failed to read {}", current.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if metadata.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        if !metadata.is_file() {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .with_context(|| format!("failed to relativize {}", path.display()))?;
        out.push(rel.to_path_buf());
    }
    Ok(())
}
