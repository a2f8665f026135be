//! The patch manifest: one JSON document per project describing every available patch.
//!
//! Loading goes through three gates: the file must exist, it must be JSON, and it
//! must match the manifest shape. Schema violations are collected, not short-circuited,
//! so the error lists every offending field at once.

use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::Config;
use crate::error::{IoContext, PatchError, Result};
use crate::purl;
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub before_hash: String,
    pub after_hash: String,
}

#[derive(Debug, Clone)]
pub struct PatchEntry {
    /// Relative path within the package -> record, in manifest order.
    pub files: Vec<(String, FileRecord)>,
    pub vulnerabilities: Map<String, Value>,
    pub description: Option<String>,
    pub license: Option<String>,
    pub tier: Option<String>,
    pub uuid: Option<String>,
    pub exported_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// Normalized purl -> entry, in manifest order.
    patches: Vec<(String, PatchEntry)>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPatchEntry {
    files: Map<String, Value>,
    #[serde(default)]
    vulnerabilities: Map<String, Value>,
    description: Option<String>,
    license: Option<String>,
    tier: Option<String>,
    uuid: Option<String>,
    exported_at: String,
}

impl Manifest {
    pub fn get(&self, normalized_purl: &str) -> Option<&PatchEntry> {
        self.patches
            .iter()
            .find(|(p, _)| p == normalized_purl)
            .map(|(_, e)| e)
    }

    pub fn contains(&self, normalized_purl: &str) -> bool {
        self.get(normalized_purl).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PatchEntry)> {
        self.patches.iter().map(|(p, e)| (p.as_str(), e))
    }

    pub fn purls(&self) -> impl Iterator<Item = &str> {
        self.patches.iter().map(|(p, _)| p.as_str())
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Parse and validate manifest text. `path` is used for error context only.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(|source| PatchError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_value(value, path)
    }

    pub fn from_value(value: Value, path: &Path) -> Result<Self> {
        let violations = validate(&value);
        if !violations.is_empty() {
            return Err(PatchError::Schema {
                path: path.to_path_buf(),
                violations,
            });
        }

        let schema_err = |msg: String| PatchError::Schema {
            path: path.to_path_buf(),
            violations: vec![msg],
        };

        let mut patches = Vec::new();
        if let Value::Object(mut root) = value {
            if let Some(Value::Object(entries)) = root.remove("patches") {
                for (key, entry) in entries {
                    let normalized = purl::normalize(&key).map_err(|e| schema_err(e.to_string()))?;
                    let raw: RawPatchEntry = serde_json::from_value(entry)
                        .map_err(|e| schema_err(format!("patches[{:?}]: {}", key, e)))?;

                    let mut files = Vec::with_capacity(raw.files.len());
                    for (name, record) in raw.files {
                        let mut record: FileRecord = serde_json::from_value(record).map_err(|e| {
                            schema_err(format!("patches[{:?}].files[{:?}]: {}", key, name, e))
                        })?;
                        record.before_hash.make_ascii_lowercase();
                        record.after_hash.make_ascii_lowercase();
                        files.push((name, record));
                    }

                    patches.push((
                        normalized,
                        PatchEntry {
                            files,
                            vulnerabilities: raw.vulnerabilities,
                            description: raw.description,
                            license: raw.license,
                            tier: raw.tier,
                            uuid: raw.uuid,
                            exported_at: raw.exported_at,
                        },
                    ));
                }
            }
        }

        Ok(Self { patches })
    }
}

/// Load and validate the manifest of the project described by `config`.
pub fn load_manifest(config: &Config) -> Result<Manifest> {
    config.ensure_project()?;
    let path = config.manifest_path();
    if !path.is_file() {
        return Err(PatchError::NotFound {
            what: "Manifest",
            path,
        });
    }
    let text = std::fs::read_to_string(&path)
        .io_context(|| format!("Failed to read manifest: {}", path.display()))?;
    let manifest = Manifest::parse(&text, &path)?;
    debug!(path = %path.display(), patches = manifest.len(), "manifest loaded");
    Ok(manifest)
}

/// Collect every shape violation in a parsed manifest document.
pub fn validate(value: &Value) -> Vec<String> {
    let mut v = Vec::new();

    let Some(root) = value.as_object() else {
        v.push("manifest: expected an object".to_string());
        return v;
    };
    let patches = match root.get("patches") {
        Some(Value::Object(p)) => p,
        Some(_) => {
            v.push("patches: expected an object".to_string());
            return v;
        }
        None => {
            v.push("patches: missing required field".to_string());
            return v;
        }
    };

    let mut seen: Vec<(String, &str)> = Vec::new();
    for (key, entry) in patches {
        let at = format!("patches[{:?}]", key);
        match purl::normalize(key) {
            Ok(normalized) => {
                if let Some((_, first)) = seen.iter().find(|(n, _)| *n == normalized) {
                    v.push(format!("{}: duplicates {:?} after normalization", at, first));
                } else {
                    seen.push((normalized, key.as_str()));
                }
            }
            Err(e) => v.push(format!("{}: {}", at, e)),
        }
        validate_entry(&at, entry, &mut v);
    }
    v
}

fn validate_entry(at: &str, entry: &Value, v: &mut Vec<String>) {
    let Some(entry) = entry.as_object() else {
        v.push(format!("{}: expected an object", at));
        return;
    };

    match entry.get("files") {
        Some(Value::Object(files)) => {
            for (name, record) in files {
                let file_at = format!("{}.files[{:?}]", at, name);
                if !util::is_safe_relative(name) {
                    v.push(format!("{}: path must be relative and stay inside the package", file_at));
                }
                let Some(record) = record.as_object() else {
                    v.push(format!("{}: expected an object", file_at));
                    continue;
                };
                for field in ["beforeHash", "afterHash"] {
                    match record.get(field) {
                        Some(Value::String(h)) if util::is_hash(&h.to_ascii_lowercase()) => {}
                        Some(Value::String(_)) => {
                            v.push(format!("{}.{}: expected a 64-character hex hash", file_at, field))
                        }
                        Some(_) => v.push(format!("{}.{}: expected a string", file_at, field)),
                        None => v.push(format!("{}.{}: missing required field", file_at, field)),
                    }
                }
            }
        }
        Some(_) => v.push(format!("{}.files: expected an object", at)),
        None => v.push(format!("{}.files: missing required field", at)),
    }

    match entry.get("vulnerabilities") {
        None | Some(Value::Object(_)) => {}
        Some(_) => v.push(format!("{}.vulnerabilities: expected an object", at)),
    }

    match entry.get("exportedAt") {
        Some(Value::String(_)) => {}
        Some(_) => v.push(format!("{}.exportedAt: expected a string", at)),
        None => v.push(format!("{}.exportedAt: missing required field", at)),
    }

    for field in ["description", "license", "tier", "uuid"] {
        match entry.get(field) {
            None | Some(Value::Null) | Some(Value::String(_)) => {}
            Some(_) => v.push(format!("{}.{}: expected a string", at, field)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn h(c: char) -> String {
        std::iter::repeat(c).take(64).collect()
    }

    fn entry(files: Value) -> Value {
        json!({
            "files": files,
            "vulnerabilities": { "GHSA-xxxx": { "cves": ["CVE-2025-1"] } },
            "description": "fix",
            "exportedAt": "2025-01-01T00:00:00Z"
        })
    }

    #[test]
    fn test_parse_preserves_order_and_normalizes_keys() {
        let doc = json!({
            "patches": {
                "pkg:npm/zeta@1.0.0": entry(json!({ "index.js": { "beforeHash": h('a'), "afterHash": h('b') } })),
                "pkg:npm/%40Scope/Alpha@2.0.0": entry(json!({ "lib/a.js": { "beforeHash": h('C'), "afterHash": h('d') } })),
            }
        });
        let manifest = Manifest::from_value(doc, Path::new("m.json")).unwrap();
        let purls: Vec<&str> = manifest.purls().collect();
        assert_eq!(purls, vec!["pkg:npm/zeta@1.0.0", "pkg:npm/%40scope/alpha@2.0.0"]);

        let alpha = manifest.get("pkg:npm/%40scope/alpha@2.0.0").unwrap();
        assert_eq!(alpha.files[0].0, "lib/a.js");
        assert_eq!(alpha.files[0].1.before_hash, h('c'));
        assert_eq!(alpha.vulnerabilities.len(), 1);
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let err = Manifest::parse("{ not json", Path::new("m.json")).unwrap_err();
        assert_eq!(err.kind(), "ParseError");
    }

    #[test]
    fn test_missing_patches_is_schema_error() {
        let err = Manifest::parse("{}", Path::new("m.json")).unwrap_err();
        assert_eq!(err.kind(), "SchemaError");
        assert!(err.to_string().contains("patches: missing required field"));
    }

    #[test]
    fn test_schema_enumerates_all_violations() {
        let doc = json!({
            "patches": {
                "not-a-purl": entry(json!({})),
                "pkg:npm/x@1.0.0": {
                    "files": { "../evil.js": { "beforeHash": "short", "afterHash": 7 } },
                    "tier": 3
                }
            }
        });
        let violations = validate(&doc);
        let joined = violations.join("\n");
        assert!(joined.contains("not-a-purl"), "{joined}");
        assert!(joined.contains("must be relative"), "{joined}");
        assert!(joined.contains("beforeHash: expected a 64-character hex hash"), "{joined}");
        assert!(joined.contains("afterHash: expected a string"), "{joined}");
        assert!(joined.contains("exportedAt: missing required field"), "{joined}");
        assert!(joined.contains("tier: expected a string"), "{joined}");
    }

    #[test]
    fn test_duplicate_after_normalization_rejected() {
        let files = json!({ "a.js": { "beforeHash": h('a'), "afterHash": h('b') } });
        let doc = json!({
            "patches": {
                "pkg:npm/%40s/x@1.0.0": entry(files.clone()),
                "pkg:npm/@s/x@1.0.0": entry(files),
            }
        });
        let err = Manifest::from_value(doc, Path::new("m.json")).unwrap_err();
        assert!(err.to_string().contains("duplicates"), "{err}");
    }

    #[test]
    fn test_empty_manifest_ok() {
        let manifest = Manifest::parse(r#"{"patches":{}}"#, Path::new("m.json")).unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_load_manifest_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        assert_eq!(load_manifest(&config).unwrap_err().kind(), "NotFoundError");

        std::fs::create_dir(config.hidden_path()).unwrap();
        let err = load_manifest(&config).unwrap_err();
        assert!(err.to_string().starts_with("Manifest not found"), "{err}");
    }
}
