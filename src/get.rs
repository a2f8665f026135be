use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::blob_store::BlobStore;
use crate::config::Config;
use crate::error::{IoContext, PatchError, Result};
use crate::manifest;
use crate::purl::Purl;
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResult {
    pub files: Vec<String>,
    pub output_dir: PathBuf,
    pub purl: String,
}

/// Copy the patched files of one patch out of the blob store into `dest_dir`
/// (default `<root>/patches/<path-safe purl>`), preserving relative paths.
///
/// Every blob is resolved before anything is written, so a missing blob leaves
/// the destination untouched.
#[instrument(skip(config, dest_dir), fields(root = %config.root().display()))]
pub fn get_patch(config: &Config, purl: &str, dest_dir: Option<&Path>) -> Result<GetResult> {
    let manifest = manifest::load_manifest(config)?;
    let parsed = Purl::parse(purl)?;
    let normalized = parsed.to_string();

    let entry = manifest
        .get(&normalized)
        .ok_or_else(|| PatchError::Input(format!("No patch found for {}", purl)))?;
    if entry.files.is_empty() {
        return Err(PatchError::Input(format!("Patch for {} contains no files", purl)));
    }

    let store = BlobStore::new(config);
    for (name, record) in &entry.files {
        store.resolve(&record.after_hash, name)?;
    }

    let output_dir = match dest_dir {
        Some(d) => d.to_path_buf(),
        None => config.default_patch_dir(&parsed),
    };
    std::fs::create_dir_all(&output_dir)
        .io_context(|| format!("Failed to create directory: {}", output_dir.display()))?;

    let mut files = Vec::with_capacity(entry.files.len());
    for (name, record) in &entry.files {
        let dest = util::join_relative(&output_dir, name);
        store.copy_to(&record.after_hash, name, &dest)?;
        debug!(file = %name, dest = %dest.display(), "copied patched file");
        files.push(name.clone());
    }

    info!(purl = %normalized, files = files.len(), out = %output_dir.display(), "patch retrieved");
    Ok(GetResult {
        files,
        output_dir,
        purl: normalized,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project(files: &[(&str, &str, Option<&[u8]>)]) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        std::fs::create_dir_all(config.hidden_path()).unwrap();
        let store = BlobStore::new(&config);

        let mut records = serde_json::Map::new();
        for (name, seed, content) in files {
            let after = match content {
                Some(c) => store.insert(c).unwrap(),
                None => util::hash_bytes(seed.as_bytes()),
            };
            records.insert(
                name.to_string(),
                json!({ "beforeHash": util::hash_bytes(b"before"), "afterHash": after }),
            );
        }
        let doc = json!({
            "patches": {
                "pkg:npm/on-headers@1.0.2": {
                    "exportedAt": "2025-01-01T00:00:00Z",
                    "files": records,
                    "vulnerabilities": {}
                }
            }
        });
        std::fs::write(config.manifest_path(), doc.to_string()).unwrap();
        (dir, config)
    }

    #[test]
    fn test_get_default_destination() {
        let (dir, config) = project(&[("lib/index.js", "", Some(b"patched!"))]);
        let result = get_patch(&config, "pkg:npm/on-headers@1.0.2", None).unwrap();

        let expected_dir = dir.path().join("patches/pkg_npm_on-headers_1.0.2");
        assert_eq!(result.output_dir, expected_dir);
        assert_eq!(result.files, vec!["lib/index.js".to_string()]);
        assert_eq!(
            std::fs::read(expected_dir.join("lib/index.js")).unwrap(),
            b"patched!"
        );
    }

    #[test]
    fn test_get_explicit_destination() {
        let (dir, config) = project(&[("a.js", "", Some(b"A")), ("sub/b.js", "", Some(b"B"))]);
        let out = dir.path().join("elsewhere");
        let result = get_patch(&config, "pkg:npm/on-headers@1.0.2", Some(&out)).unwrap();
        assert_eq!(result.files, vec!["a.js".to_string(), "sub/b.js".to_string()]);
        assert_eq!(std::fs::read(out.join("sub/b.js")).unwrap(), b"B");
    }

    #[test]
    fn test_get_unknown_purl_reports_requested_spelling() {
        let (_dir, config) = project(&[("a.js", "", Some(b"A"))]);
        let err = get_patch(&config, "pkg:npm/Missing@9.9.9", None).unwrap_err();
        assert_eq!(err.kind(), "InputError");
        assert!(err.to_string().contains("pkg:npm/Missing@9.9.9"), "{err}");
    }

    #[test]
    fn test_get_missing_blob_writes_nothing() {
        let (dir, config) = project(&[("a.js", "", Some(b"A")), ("b.js", "lost", None)]);
        let err = get_patch(&config, "pkg:npm/on-headers@1.0.2", None).unwrap_err();
        match err {
            PatchError::BlobNotFound { hash, file } => {
                assert_eq!(hash, util::hash_bytes(b"lost"));
                assert_eq!(file, "b.js");
            }
            other => panic!("unexpected error: {other}"),
        }
        let out = dir.path().join("patches/pkg_npm_on-headers_1.0.2");
        assert!(!out.join("b.js").exists());
        assert!(!out.join("a.js").exists());
    }
}
