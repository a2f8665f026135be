use std::path::{Path, PathBuf};

use crate::error::{PatchError, Result};
use crate::purl::Purl;

pub const DEFAULT_HIDDEN_DIR: &str = ".socket";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const BLOBS_DIR: &str = "blobs";
pub const BACKUPS_DIR: &str = "backups";
pub const PATCHES_OUT_DIR: &str = "patches";

/// What apply does with a target whose content matches neither hash of its file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriftPolicy {
    /// Report a drift failure for the purl and leave every file untouched.
    #[default]
    Abort,
    /// Back up the drifted content and patch anyway.
    Overwrite,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub project_root: PathBuf,
    pub hidden_dir: String,
    /// Re-hash blob content against its name on every read.
    pub verify_blobs: bool,
    pub drift_policy: DriftPolicy,
}

impl Config {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            hidden_dir: DEFAULT_HIDDEN_DIR.to_string(),
            verify_blobs: false,
            drift_policy: DriftPolicy::Abort,
        }
    }

    pub fn root(&self) -> &Path {
        &self.project_root
    }

    pub fn hidden_path(&self) -> PathBuf {
        self.project_root.join(&self.hidden_dir)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.hidden_path().join(MANIFEST_FILE)
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.hidden_path().join(BLOBS_DIR)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.hidden_path().join(BACKUPS_DIR)
    }

    pub fn default_patch_dir(&self, purl: &Purl) -> PathBuf {
        self.project_root.join(PATCHES_OUT_DIR).join(purl.path_safe())
    }

    /// Precondition for every operation: the hidden directory must exist.
    pub fn ensure_project(&self) -> Result<()> {
        let hidden = self.hidden_path();
        if !hidden.is_dir() {
            return Err(PatchError::NotFound {
                what: "Patch directory",
                path: hidden,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let config = Config::new("/proj");
        assert_eq!(config.manifest_path(), Path::new("/proj/.socket/manifest.json"));
        assert_eq!(config.blobs_dir(), Path::new("/proj/.socket/blobs"));
        assert_eq!(config.backups_dir(), Path::new("/proj/.socket/backups"));

        let purl = Purl::parse("pkg:npm/on-headers@1.0.2").unwrap();
        assert_eq!(
            config.default_patch_dir(&purl),
            Path::new("/proj/patches/pkg_npm_on-headers_1.0.2")
        );
    }

    #[test]
    fn test_ensure_project_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        let err = config.ensure_project().unwrap_err();
        assert_eq!(err.kind(), "NotFoundError");

        std::fs::create_dir(dir.path().join(DEFAULT_HIDDEN_DIR)).unwrap();
        config.ensure_project().unwrap();
    }
}
