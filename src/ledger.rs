//! Undo ledger: the persisted pre-patch state needed to revert an applied patch.
//!
//! On disk each backup instance is a directory `backups/<uuid>/` holding
//! `files/<n>` (zstd-compressed original content, one per restore pair) and
//! `record.bin` (magic header + zstd-compressed bincode [`UndoRecord`]).
//! The record is written last and removed first, so a directory without a
//! readable record is debris, never a half-valid backup.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{IoContext, PatchError, Result};
use crate::util;

pub const RECORD_MAGIC: &[u8; 8] = b"UNDOV001";
pub const RECORD_VERSION: u32 = 2;
const RECORD_FILE: &str = "record.bin";
const FILES_DIR: &str = "files";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreEntry {
    /// Path relative to the package, as named in the manifest.
    pub file_name: String,
    /// Absolute path of the file that gets overwritten.
    pub target: PathBuf,
    /// Where the pre-patch content is kept.
    pub backup: PathBuf,
    /// Hash of the backed-up content.
    pub before_hash: String,
    /// Hash the target has once patched.
    pub after_hash: String,
    /// Unix permission bits of the target before patching.
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoRecord {
    pub version: u32,
    pub uuid: Uuid,
    pub purl: String,
    /// Position in the ledger; strictly increasing across records.
    pub sequence: u64,
    /// Unix milliseconds.
    pub created_at: u64,
    pub restore_paths: Vec<RestoreEntry>,
}

/// Pre-patch content of one target, captured before it is overwritten.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    pub file_name: String,
    pub target: PathBuf,
    pub content: Vec<u8>,
    pub after_hash: String,
    pub mode: Option<u32>,
}

pub trait UndoLedger: Send + Sync {
    /// Persist the snapshots and their record. Must be durable when this returns.
    fn create(&self, purl: &str, snapshots: &[FileSnapshot]) -> Result<UndoRecord>;

    /// Every readable record.
    fn records(&self) -> Result<Vec<UndoRecord>>;

    fn read_backup(&self, record: &UndoRecord, entry: &RestoreEntry) -> Result<Vec<u8>>;

    /// Delete a record and its backup artifacts. Returns false if it did not exist.
    fn discard(&self, uuid: &Uuid) -> Result<bool>;

    /// Remove leftovers that carry no readable record. Returns how many were removed.
    fn sweep_debris(&self) -> Result<usize> {
        Ok(0)
    }

    /// True if anything is stored under `uuid`, readable record or not.
    fn contains(&self, uuid: &Uuid) -> Result<bool> {
        Ok(self.records()?.iter().any(|r| &r.uuid == uuid))
    }

    fn latest_for(&self, purl: &str) -> Result<Option<UndoRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.purl == purl)
            .max_by_key(|r| r.sequence))
    }
}

fn next_sequence<'r>(records: impl IntoIterator<Item = &'r UndoRecord>) -> u64 {
    records.into_iter().map(|r| r.sequence).max().map_or(1, |s| s + 1)
}

fn new_record(uuid: Uuid, purl: &str, sequence: u64, restore_paths: Vec<RestoreEntry>) -> UndoRecord {
    UndoRecord {
        version: RECORD_VERSION,
        uuid,
        purl: purl.to_string(),
        sequence,
        created_at: util::now_millis(),
        restore_paths,
    }
}

/// File-backed ledger under `<hidden>/backups`.
#[derive(Debug, Clone)]
pub struct FsLedger {
    dir: PathBuf,
}

impl FsLedger {
    pub fn new(config: &Config) -> Self {
        Self::at(config.backups_dir())
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_dir(&self, uuid: &Uuid) -> PathBuf {
        self.dir.join(uuid.to_string())
    }

    fn write_backup(
        &self,
        record_dir: &Path,
        purl: &str,
        uuid: Uuid,
        sequence: u64,
        snapshots: &[FileSnapshot],
    ) -> Result<UndoRecord> {
        let files_dir = record_dir.join(FILES_DIR);
        std::fs::create_dir_all(&files_dir)
            .io_context(|| format!("Failed to create backup directory: {}", files_dir.display()))?;

        let mut restore_paths = Vec::with_capacity(snapshots.len());
        for (i, snap) in snapshots.iter().enumerate() {
            let backup = files_dir.join(i.to_string());
            let compressed = zstd::bulk::compress(&snap.content, 3)
                .io_context(|| format!("Failed to compress backup of {}", snap.target.display()))?;
            util::write_atomic(&backup, &compressed)?;
            restore_paths.push(RestoreEntry {
                file_name: snap.file_name.clone(),
                target: snap.target.clone(),
                backup,
                before_hash: util::hash_bytes(&snap.content),
                after_hash: snap.after_hash.clone(),
                mode: snap.mode,
            });
        }

        let record = new_record(uuid, purl, sequence, restore_paths);
        let encoded = bincode::serialize(&record)
            .map_err(|e| PatchError::Ledger(format!("Failed to serialize undo record: {}", e)))?;
        let compressed = zstd::bulk::compress(&encoded, 3)
            .io_context(|| "Failed to compress undo record")?;
        let mut bytes = Vec::with_capacity(RECORD_MAGIC.len() + compressed.len());
        bytes.extend_from_slice(RECORD_MAGIC);
        bytes.extend_from_slice(&compressed);
        util::write_atomic(&record_dir.join(RECORD_FILE), &bytes)?;
        sync_dir(record_dir);
        sync_dir(&self.dir);
        Ok(record)
    }

    fn read_record(path: &Path) -> Result<UndoRecord> {
        let raw = std::fs::read(path)
            .io_context(|| format!("Failed to read undo record: {}", path.display()))?;
        if raw.len() < RECORD_MAGIC.len() || &raw[..RECORD_MAGIC.len()] != RECORD_MAGIC {
            return Err(PatchError::Ledger(format!(
                "Invalid undo record {}: missing magic header",
                path.display()
            )));
        }
        let decoder = zstd::Decoder::new(&raw[RECORD_MAGIC.len()..])
            .io_context(|| "Failed to create zstd decoder")?;
        let record: UndoRecord = bincode::deserialize_from(decoder).map_err(|e| {
            PatchError::Ledger(format!("Failed to decode undo record {}: {}", path.display(), e))
        })?;
        if record.version != RECORD_VERSION {
            return Err(PatchError::Ledger(format!(
                "Unsupported undo record version: {} (expected {})",
                record.version, RECORD_VERSION
            )));
        }
        Ok(record)
    }

    /// Backup directories in the ledger, with their record if it is readable.
    fn scan(&self) -> Result<Vec<(PathBuf, Option<UndoRecord>)>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).io_context(|| format!("Failed to read backups: {}", self.dir.display()))
            }
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.io_context(|| format!("Failed to read backups: {}", self.dir.display()))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match Self::read_record(&path.join(RECORD_FILE)) {
                Ok(record) => out.push((path, Some(record))),
                Err(e) => {
                    warn!(dir = %path.display(), error = %e, "skipping backup without a readable record");
                    out.push((path, None));
                }
            }
        }
        Ok(out)
    }
}

impl UndoLedger for FsLedger {
    fn create(&self, purl: &str, snapshots: &[FileSnapshot]) -> Result<UndoRecord> {
        let uuid = Uuid::new_v4();
        let record_dir = self.record_dir(&uuid);
        let sequence = next_sequence(&self.records()?);
        match self.write_backup(&record_dir, purl, uuid, sequence, snapshots) {
            Ok(record) => {
                debug!(%uuid, %purl, files = snapshots.len(), "undo record written");
                Ok(record)
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&record_dir);
                Err(e)
            }
        }
    }

    fn records(&self) -> Result<Vec<UndoRecord>> {
        let mut records: Vec<UndoRecord> =
            self.scan()?.into_iter().filter_map(|(_, r)| r).collect();
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    fn contains(&self, uuid: &Uuid) -> Result<bool> {
        Ok(self.record_dir(uuid).is_dir())
    }

    fn read_backup(&self, _record: &UndoRecord, entry: &RestoreEntry) -> Result<Vec<u8>> {
        let raw = std::fs::read(&entry.backup)
            .io_context(|| format!("Failed to read backup: {}", entry.backup.display()))?;
        zstd::decode_all(raw.as_slice())
            .io_context(|| format!("Failed to decompress backup: {}", entry.backup.display()))
    }

    fn discard(&self, uuid: &Uuid) -> Result<bool> {
        let dir = self.record_dir(uuid);
        if !dir.is_dir() {
            return Ok(false);
        }
        let record = dir.join(RECORD_FILE);
        match std::fs::remove_file(&record) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).io_context(|| format!("Failed to delete undo record: {}", record.display()))
            }
        }
        sync_dir(&dir);
        std::fs::remove_dir_all(&dir)
            .io_context(|| format!("Failed to delete backup: {}", dir.display()))?;
        debug!(%uuid, "undo record discarded");
        Ok(true)
    }

    fn sweep_debris(&self) -> Result<usize> {
        let mut removed = 0;
        for (dir, record) in self.scan()? {
            if record.is_none() {
                std::fs::remove_dir_all(&dir)
                    .io_context(|| format!("Failed to delete backup debris: {}", dir.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Flush directory entries so renames survive a crash. Not supported everywhere.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = std::fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// In-process ledger.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<(UndoRecord, Vec<Vec<u8>>)>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<(UndoRecord, Vec<Vec<u8>>)>>> {
        self.records
            .lock()
            .map_err(|_| PatchError::Ledger("in-memory ledger poisoned".to_string()))
    }
}

impl UndoLedger for MemoryLedger {
    fn create(&self, purl: &str, snapshots: &[FileSnapshot]) -> Result<UndoRecord> {
        let uuid = Uuid::new_v4();
        let mut guard = self.lock()?;
        let sequence = next_sequence(guard.iter().map(|(r, _)| r));
        let restore_paths = snapshots
            .iter()
            .enumerate()
            .map(|(i, snap)| RestoreEntry {
                file_name: snap.file_name.clone(),
                target: snap.target.clone(),
                backup: PathBuf::from(format!("memory://{}/{}", uuid, i)),
                before_hash: util::hash_bytes(&snap.content),
                after_hash: snap.after_hash.clone(),
                mode: snap.mode,
            })
            .collect();
        let record = new_record(uuid, purl, sequence, restore_paths);
        let contents = snapshots.iter().map(|s| s.content.clone()).collect();
        guard.push((record.clone(), contents));
        Ok(record)
    }

    fn records(&self) -> Result<Vec<UndoRecord>> {
        Ok(self.lock()?.iter().map(|(r, _)| r.clone()).collect())
    }

    fn read_backup(&self, record: &UndoRecord, entry: &RestoreEntry) -> Result<Vec<u8>> {
        let guard = self.lock()?;
        let (stored, contents) = guard
            .iter()
            .find(|(r, _)| r.uuid == record.uuid)
            .ok_or_else(|| PatchError::Ledger(format!("Unknown backup {}", record.uuid)))?;
        stored
            .restore_paths
            .iter()
            .position(|e| e.backup == entry.backup)
            .and_then(|i| contents.get(i).cloned())
            .ok_or_else(|| PatchError::Ledger(format!("Missing backup {}", entry.backup.display())))
    }

    fn discard(&self, uuid: &Uuid) -> Result<bool> {
        let mut guard = self.lock()?;
        let before = guard.len();
        guard.retain(|(r, _)| &r.uuid != uuid);
        Ok(guard.len() != before)
    }
}
