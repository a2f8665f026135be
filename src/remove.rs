use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{PatchError, Result};
use crate::ledger::UndoLedger;
use crate::manifest;
use crate::purl;
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveResult {
    pub files_restored: usize,
    pub purl: String,
    pub backup_uuid: Uuid,
}

/// Revert the most recent application of `purl` from its undo record.
///
/// Files are restored newest-first. The record is discarded only after every
/// file is back; on a partial failure it stays so the restore can be retried.
#[instrument(skip(config, ledger), fields(root = %config.root().display()))]
pub fn remove_patch(config: &Config, ledger: &dyn UndoLedger, purl: &str) -> Result<RemoveResult> {
    manifest::load_manifest(config)?;
    let normalized = purl::normalize(purl)?;

    let record = ledger.latest_for(&normalized)?.ok_or_else(|| {
        PatchError::Input(format!(
            "No backup found for {}: the patch was not applied, or was already removed",
            purl
        ))
    })?;

    let total = record.restore_paths.len();
    let mut restored = 0;
    for entry in record.restore_paths.iter().rev() {
        let result = ledger.read_backup(&record, entry).and_then(|data| {
            let actual = util::hash_bytes(&data);
            if actual != entry.before_hash {
                return Err(PatchError::BlobCorrupt {
                    file: entry.file_name.clone(),
                    expected: entry.before_hash.clone(),
                    actual,
                });
            }
            util::write_atomic_with_mode(&entry.target, &data, entry.mode)
        });
        if let Err(e) = result {
            warn!(uuid = %record.uuid, file = %entry.file_name, restored, total, "restore incomplete");
            return Err(PatchError::RestoreIncomplete {
                purl: normalized,
                restored,
                total,
                source: Box::new(e),
            });
        }
        debug!(file = %entry.file_name, target = %entry.target.display(), "restored");
        restored += 1;
    }

    ledger.discard(&record.uuid)?;
    info!(purl = %normalized, uuid = %record.uuid, files = restored, "patch removed");
    Ok(RemoveResult {
        files_restored: restored,
        purl: normalized,
        backup_uuid: record.uuid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{FileSnapshot, FsLedger, MemoryLedger};

    fn project() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        std::fs::create_dir_all(config.hidden_path()).unwrap();
        std::fs::write(config.manifest_path(), r#"{"patches":{}}"#).unwrap();
        (dir, config)
    }

    fn snapshot(config: &Config, name: &str, original: &[u8]) -> FileSnapshot {
        let target = config.root().join("pkg").join(name);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"patched").unwrap();
        let mode = util::file_mode(&target);
        FileSnapshot {
            file_name: name.to_string(),
            target,
            content: original.to_vec(),
            after_hash: util::hash_bytes(b"patched"),
            mode,
        }
    }

    #[test]
    fn test_restores_and_discards_record() {
        let (_dir, config) = project();
        let ledger = FsLedger::new(&config);
        let snaps = vec![
            snapshot(&config, "a.js", b"orig a"),
            snapshot(&config, "lib/b.js", b"orig b"),
        ];
        let record = ledger.create("pkg:npm/x@1.0.0", &snaps).unwrap();

        let result = remove_patch(&config, &ledger, "pkg:npm/X@1.0.0").unwrap();
        assert_eq!(result.files_restored, 2);
        assert_eq!(result.purl, "pkg:npm/x@1.0.0");
        assert_eq!(result.backup_uuid, record.uuid);
        assert_eq!(std::fs::read(config.root().join("pkg/a.js")).unwrap(), b"orig a");
        assert_eq!(std::fs::read(config.root().join("pkg/lib/b.js")).unwrap(), b"orig b");
        assert!(ledger.records().unwrap().is_empty());
    }

    #[test]
    fn test_not_applied_is_input_error() {
        let (_dir, config) = project();
        let err = remove_patch(&config, &MemoryLedger::new(), "pkg:npm/x@1.0.0").unwrap_err();
        assert_eq!(err.kind(), "InputError");
        assert!(err.to_string().contains("already removed"));
    }

    #[test]
    fn test_partial_failure_keeps_record() {
        let (_dir, config) = project();
        let ledger = FsLedger::new(&config);
        let snaps = vec![
            snapshot(&config, "a.js", b"orig a"),
            snapshot(&config, "b.js", b"orig b"),
        ];
        let record = ledger.create("pkg:npm/x@1.0.0", &snaps).unwrap();
        // The first entry is restored last; corrupt its backup.
        std::fs::write(&record.restore_paths[0].backup, b"not zstd").unwrap();

        let err = remove_patch(&config, &ledger, "pkg:npm/x@1.0.0").unwrap_err();
        match &err {
            PatchError::RestoreIncomplete { restored, total, .. } => {
                assert_eq!(*restored, 1);
                assert_eq!(*total, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read(config.root().join("pkg/b.js")).unwrap(), b"orig b");
        assert_eq!(ledger.records().unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_restores_recorded_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, config) = project();
        let ledger = FsLedger::new(&config);
        let mut snap = snapshot(&config, "bin/run", b"#!/bin/sh\nexit 0\n");
        snap.mode = Some(0o755);
        ledger.create("pkg:npm/x@1.0.0", &[snap]).unwrap();
        let target = config.root().join("pkg/bin/run");
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o644)).unwrap();

        remove_patch(&config, &ledger, "pkg:npm/x@1.0.0").unwrap();
        assert_eq!(util::file_mode(&target), Some(0o755));
        assert_eq!(std::fs::read(&target).unwrap(), b"#!/bin/sh\nexit 0\n");
    }
}
