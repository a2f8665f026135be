//! Content-addressed blob store: `<hidden>/blobs/<hash>`, one immutable file per hash.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{IoContext, PatchError, Result};
use crate::util;

#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
    verify_reads: bool,
}

impl BlobStore {
    pub fn new(config: &Config) -> Self {
        Self {
            dir: config.blobs_dir(),
            verify_reads: config.verify_blobs,
        }
    }

    pub fn path_for(&self, hash: &str) -> PathBuf {
        self.dir.join(hash)
    }

    /// Resolve `hash` to the blob's path. `file` names the manifest entry that asked for it.
    pub fn resolve(&self, hash: &str, file: &str) -> Result<PathBuf> {
        let not_found = || PatchError::BlobNotFound {
            hash: hash.to_string(),
            file: file.to_string(),
        };
        if !util::is_hash(hash) {
            return Err(not_found());
        }
        let path = self.path_for(hash);
        if !path.is_file() {
            return Err(not_found());
        }
        Ok(path)
    }

    /// Read a blob, re-hashing it when read verification is enabled.
    pub fn read(&self, hash: &str, file: &str) -> Result<Vec<u8>> {
        if self.verify_reads {
            return self.read_verified(hash, file);
        }
        let path = self.resolve(hash, file)?;
        std::fs::read(&path).io_context(|| format!("Failed to read blob: {}", path.display()))
    }

    pub fn read_verified(&self, hash: &str, file: &str) -> Result<Vec<u8>> {
        let path = self.resolve(hash, file)?;
        let data =
            std::fs::read(&path).io_context(|| format!("Failed to read blob: {}", path.display()))?;
        let actual = util::hash_bytes(&data);
        if actual != hash {
            warn!(%hash, %actual, %file, "blob content does not match its name");
            return Err(PatchError::BlobCorrupt {
                file: file.to_string(),
                expected: hash.to_string(),
                actual,
            });
        }
        Ok(data)
    }

    /// Copy a blob to `dest`, verifying its content when read verification is enabled.
    pub fn copy_to(&self, hash: &str, file: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .io_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        if self.verify_reads {
            let data = self.read_verified(hash, file)?;
            return std::fs::write(dest, data)
                .io_context(|| format!("Failed to write file: {}", dest.display()));
        }
        let src = self.resolve(hash, file)?;
        std::fs::copy(&src, dest)
            .io_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
        Ok(())
    }

    /// Store `data` under its computed hash. An existing blob is verified, not rewritten.
    pub fn insert(&self, data: &[u8]) -> Result<String> {
        let hash = util::hash_bytes(data);
        self.insert_as(&hash, data)?;
        Ok(hash)
    }

    /// Store `data` under `hash`, refusing content that does not hash to that name.
    pub fn insert_as(&self, hash: &str, data: &[u8]) -> Result<()> {
        let actual = util::hash_bytes(data);
        if actual != hash {
            return Err(PatchError::BlobCorrupt {
                file: hash.to_string(),
                expected: hash.to_string(),
                actual,
            });
        }
        let path = self.path_for(hash);
        if path.is_file() {
            let existing = util::hash_file(&path)?;
            if existing == hash {
                debug!(%hash, "blob already present");
                return Ok(());
            }
            warn!(%hash, %existing, "replacing corrupt blob");
        }
        util::write_atomic(&path, data)?;
        debug!(%hash, bytes = data.len(), "blob stored");
        Ok(())
    }
}

/// Resolve a content hash to its blob path under the project's store.
pub fn resolve_blob(config: &Config, hash: &str, file: &str) -> Result<PathBuf> {
    BlobStore::new(config).resolve(hash, file)
}
