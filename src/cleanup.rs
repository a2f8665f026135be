use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{PatchError, Result};
use crate::ledger::UndoLedger;
use crate::manifest;

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    /// Forget every backup, whether or not its purl is still in the manifest.
    pub all: bool,
    /// Discard exactly this backup.
    pub uuid: Option<Uuid>,
    pub dry_run: bool,
    pub cancel: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResult {
    pub removed: usize,
    pub backups: Vec<RemovedBackup>,
    /// Backup directories without a readable record (only swept with `all`).
    pub debris_removed: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedBackup {
    pub uuid: Uuid,
    /// `None` when the backup had no readable record.
    pub purl: Option<String>,
}

/// Delete undo records: one by uuid, every orphan (default), or all of them.
/// Never touches the manifest or the blob store.
#[instrument(skip(config, ledger, options), fields(root = %config.root().display(), all = options.all))]
pub fn cleanup_backups(config: &Config, ledger: &dyn UndoLedger, options: &CleanupOptions) -> Result<CleanupResult> {
    config.ensure_project()?;
    let mut result = CleanupResult {
        dry_run: options.dry_run,
        ..Default::default()
    };
    let records = ledger.records()?;

    if let Some(uuid) = options.uuid {
        if !ledger.contains(&uuid)? {
            return Err(PatchError::Input(format!("No backup with id {}", uuid)));
        }
        let purl = records.into_iter().find(|r| r.uuid == uuid).map(|r| r.purl);
        if purl.is_none() {
            warn!(%uuid, "backup has no readable record, discarding it anyway");
        }
        if options.dry_run || ledger.discard(&uuid)? {
            result.backups.push(RemovedBackup { uuid, purl });
        }
        result.removed = result.backups.len();
        return Ok(result);
    }

    let doomed: Vec<_> = if options.all {
        records
    } else {
        let manifest = manifest::load_manifest(config)?;
        records
            .into_iter()
            .filter(|r| !manifest.contains(&r.purl))
            .collect()
    };

    for record in doomed {
        if options
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            warn!(removed = result.backups.len(), "cleanup cancelled");
            break;
        }
        if !options.dry_run && !ledger.discard(&record.uuid)? {
            continue;
        }
        result.backups.push(RemovedBackup {
            uuid: record.uuid,
            purl: Some(record.purl),
        });
    }
    if options.all && !options.dry_run {
        result.debris_removed = ledger.sweep_debris()?;
    }

    result.removed = result.backups.len();
    info!(removed = result.removed, debris = result.debris_removed, "backups cleaned up");
    Ok(result)
}
