use std::io::Write;
use std::path::{Component, Path, PathBuf};

use crate::error::{IoContext, Result};

/// Hex-encoded BLAKE3 hash of a byte slice. This is the blob store key format.
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Stream-hash a file using BLAKE3.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn hash_file(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .io_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = std::io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut reader, &mut hasher)
        .io_context(|| format!("Failed to hash file: {}", path.display()))?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// True for a 64 character lowercase hex digest.
pub fn is_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Write `data` to `path` through a sibling temp file, fsync it, then rename over the target.
/// Readers never observe a half-written file. An existing target keeps its permissions.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    write_atomic_with_mode(path, data, None)
}

/// Like [`write_atomic`], but with explicit unix permission bits when `mode` is set.
pub fn write_atomic_with_mode(path: &Path, data: &[u8], mode: Option<u32>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .io_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let permissions = permissions_for(path, mode);
    let tmp = tmp_sibling(path);
    let staged = stage(&tmp, data, permissions).and_then(|()| {
        std::fs::rename(&tmp, path).io_context(|| {
            format!("Failed to move {} into place at {}", tmp.display(), path.display())
        })
    });
    if staged.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    staged
}

fn stage(tmp: &Path, data: &[u8], permissions: Option<std::fs::Permissions>) -> Result<()> {
    let mut file = std::fs::File::create(tmp)
        .io_context(|| format!("Failed to create temp file: {}", tmp.display()))?;
    file.write_all(data)
        .io_context(|| format!("Failed to write temp file: {}", tmp.display()))?;
    file.sync_all()
        .io_context(|| format!("Failed to sync temp file: {}", tmp.display()))?;
    drop(file);
    if let Some(permissions) = permissions {
        std::fs::set_permissions(tmp, permissions)
            .io_context(|| format!("Failed to set permissions on {}", tmp.display()))?;
    }
    Ok(())
}

#[cfg(unix)]
fn permissions_for(path: &Path, mode: Option<u32>) -> Option<std::fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    match mode {
        Some(mode) => Some(std::fs::Permissions::from_mode(mode)),
        None => std::fs::metadata(path).ok().map(|m| m.permissions()),
    }
}

#[cfg(not(unix))]
fn permissions_for(path: &Path, _mode: Option<u32>) -> Option<std::fs::Permissions> {
    std::fs::metadata(path).ok().map(|m| m.permissions())
}

/// Permission bits of an existing file; `None` off unix or when it cannot be read.
#[cfg(unix)]
pub fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub fn file_mode(_path: &Path) -> Option<u32> {
    None
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

/// A manifest file name must stay inside the package: relative, no `..`, no root or prefix.
pub fn is_safe_relative(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Join a forward-slash relative path onto `root` component by component.
pub fn join_relative(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .fold(root.to_path_buf(), |acc, seg| acc.join(seg))
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
