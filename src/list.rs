use serde::Serialize;
use tracing::instrument;

use crate::config::Config;
use crate::error::Result;
use crate::manifest::{self, Manifest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSummary {
    pub purl: String,
    pub uuid: Option<String>,
    pub description: Option<String>,
    pub exported_at: String,
    pub license: Option<String>,
    pub tier: Option<String>,
    pub file_count: usize,
    pub vulnerability_count: usize,
}

/// Summaries for every patch in the manifest, in manifest order.
#[instrument(skip(config), fields(root = %config.root().display()))]
pub fn list_patches(config: &Config) -> Result<Vec<PatchSummary>> {
    let manifest = manifest::load_manifest(config)?;
    Ok(summarize(&manifest))
}

pub fn summarize(manifest: &Manifest) -> Vec<PatchSummary> {
    manifest
        .iter()
        .map(|(purl, entry)| PatchSummary {
            purl: purl.to_string(),
            uuid: entry.uuid.clone(),
            description: entry.description.clone(),
            exported_at: entry.exported_at.clone(),
            license: entry.license.clone(),
            tier: entry.tier.clone(),
            file_count: entry.files.len(),
            vulnerability_count: entry.vulnerabilities.len(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_summaries_keep_manifest_order() {
        let h = |c: char| std::iter::repeat(c).take(64).collect::<String>();
        let text = serde_json::json!({
            "patches": {
                "pkg:npm/zzz@1.0.0": {
                    "uuid": "11111111-1111-4111-8111-111111111111",
                    "exportedAt": "2025-02-01T00:00:00Z",
                    "tier": "free",
                    "files": {
                        "a.js": { "beforeHash": h('a'), "afterHash": h('b') },
                        "b.js": { "beforeHash": h('c'), "afterHash": h('d') }
                    },
                    "vulnerabilities": {}
                },
                "pkg:npm/aaa@2.0.0": {
                    "exportedAt": "2025-03-01T00:00:00Z",
                    "license": "MIT",
                    "files": { "x.js": { "beforeHash": h('e'), "afterHash": h('f') } },
                    "vulnerabilities": { "GHSA-1": {}, "GHSA-2": {} }
                }
            }
        })
        .to_string();
        let manifest = Manifest::parse(&text, Path::new("m.json")).unwrap();

        let first = summarize(&manifest);
        assert_eq!(first, summarize(&manifest));
        assert_eq!(first[0].purl, "pkg:npm/zzz@1.0.0");
        assert_eq!(first[0].file_count, 2);
        assert_eq!(first[0].vulnerability_count, 0);
        assert_eq!(first[0].tier.as_deref(), Some("free"));
        assert_eq!(first[1].purl, "pkg:npm/aaa@2.0.0");
        assert_eq!(first[1].vulnerability_count, 2);
        assert_eq!(first[1].uuid, None);

        let json = serde_json::to_value(&first[1]).unwrap();
        assert_eq!(json["exportedAt"], "2025-03-01T00:00:00Z");
        assert_eq!(json["fileCount"], 1);
    }
}
