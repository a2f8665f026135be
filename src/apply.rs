use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::blob_store::BlobStore;
use crate::config::{Config, DriftPolicy};
use crate::error::{IoContext, PatchError, Result};
use crate::ledger::{FileSnapshot, UndoLedger, UndoRecord};
use crate::manifest::{self, FileRecord, PatchEntry};
use crate::purl::Purl;
use crate::resolver::PackageResolver;
use crate::util;

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Purls to apply. Empty means every manifest purl whose package is installed.
    pub purls: Vec<String>,
    /// Run every check, write nothing.
    pub dry_run: bool,
    /// Checked between purls; once set the remaining purls are reported as cancelled.
    pub cancel: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PurlStatus {
    #[serde(rename_all = "camelCase")]
    Applied {
        backup_uuid: Uuid,
        files_modified: Vec<String>,
        files_already_patched: Vec<String>,
    },
    AlreadyApplied,
    WouldApply {
        files: Vec<String>,
    },
    Failed {
        kind: String,
        message: String,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurlResult {
    pub purl: String,
    #[serde(flatten)]
    pub status: PurlStatus,
}

impl PurlResult {
    fn failed(purl: impl Into<String>, err: &PatchError) -> Self {
        Self {
            purl: purl.into(),
            status: PurlStatus::Failed {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, PurlStatus::Failed { .. } | PurlStatus::Cancelled)
    }

    /// Error code of a failed purl.
    pub fn error_kind(&self) -> Option<&str> {
        match &self.status {
            PurlStatus::Failed { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied: Vec<PurlResult>,
}

impl ApplyReport {
    pub fn failures(&self) -> usize {
        self.applied.iter().filter(|r| r.is_failure()).count()
    }

    pub fn get(&self, purl: &str) -> Option<&PurlResult> {
        self.applied.iter().find(|r| r.purl == purl)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetState {
    Unpatched,
    Patched,
    Drifted(String),
}

struct FilePlan<'m> {
    name: &'m str,
    record: &'m FileRecord,
    target: PathBuf,
    state: TargetState,
}

/// Applies manifest patches to installed packages, one purl at a time.
pub struct Applier<'a> {
    config: &'a Config,
    resolver: &'a dyn PackageResolver,
    ledger: &'a dyn UndoLedger,
    store: BlobStore,
}

impl<'a> Applier<'a> {
    pub fn new(config: &'a Config, resolver: &'a dyn PackageResolver, ledger: &'a dyn UndoLedger) -> Self {
        Self {
            config,
            resolver,
            ledger,
            store: BlobStore::new(config),
        }
    }

    #[instrument(skip(self, options), fields(root = %self.config.root().display()))]
    pub fn run(&self, options: &ApplyOptions) -> Result<ApplyReport> {
        let manifest = manifest::load_manifest(self.config)?;
        let root = self.config.root();
        let mut report = ApplyReport::default();

        // (normalized purl, entry, package dir) per target, or an early per-purl failure.
        let mut work: Vec<std::result::Result<(String, &PatchEntry, PathBuf), PurlResult>> = Vec::new();

        if options.purls.is_empty() {
            for (purl, entry) in manifest.iter() {
                let parsed = match Purl::parse(purl) {
                    Ok(p) => p,
                    Err(e) => {
                        work.push(Err(PurlResult::failed(purl, &e)));
                        continue;
                    }
                };
                match self.resolver.resolve(root, &parsed) {
                    Ok(Some(dir)) => work.push(Ok((purl.to_string(), entry, dir))),
                    Ok(None) => debug!(%purl, "package not installed, skipping"),
                    Err(e) => work.push(Err(PurlResult::failed(purl, &e))),
                }
            }
        } else {
            let mut seen: Vec<String> = Vec::new();
            for requested in &options.purls {
                let parsed = match Purl::parse(requested) {
                    Ok(p) => p,
                    Err(e) => {
                        work.push(Err(PurlResult::failed(requested.as_str(), &e)));
                        continue;
                    }
                };
                let normalized = parsed.to_string();
                if seen.contains(&normalized) {
                    continue;
                }
                seen.push(normalized.clone());

                let Some(entry) = manifest.get(&normalized) else {
                    let err = PatchError::Input(format!("No patch found for {}", requested));
                    work.push(Err(PurlResult::failed(normalized, &err)));
                    continue;
                };
                match self.resolver.resolve(root, &parsed) {
                    Ok(Some(dir)) => work.push(Ok((normalized, entry, dir))),
                    Ok(None) => {
                        let err = PatchError::PackageNotFound {
                            purl: normalized.clone(),
                            root: root.to_path_buf(),
                        };
                        work.push(Err(PurlResult::failed(normalized, &err)));
                    }
                    Err(e) => work.push(Err(PurlResult::failed(normalized, &e))),
                }
            }
        }

        for item in work {
            let cancelled = options
                .cancel
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::SeqCst));
            let (purl, entry, package_dir) = match item {
                Ok(target) if cancelled => {
                    report.applied.push(PurlResult {
                        purl: target.0,
                        status: PurlStatus::Cancelled,
                    });
                    continue;
                }
                Ok(target) => target,
                Err(failure) => {
                    report.applied.push(failure);
                    continue;
                }
            };

            let status = match self.apply_one(&purl, entry, &package_dir, options.dry_run) {
                Ok(status) => {
                    if let PurlStatus::Applied { backup_uuid, files_modified, .. } = &status {
                        info!(%purl, %backup_uuid, files = files_modified.len(), "patch applied");
                    }
                    status
                }
                Err(e) => {
                    warn!(%purl, error = %e, "patch not applied");
                    report.applied.push(PurlResult::failed(purl, &e));
                    continue;
                }
            };
            report.applied.push(PurlResult { purl, status });
        }

        Ok(report)
    }

    /// Apply one patch. Either every file ends up patched or every file is left as found.
    fn apply_one(&self, purl: &str, entry: &PatchEntry, package_dir: &Path, dry_run: bool) -> Result<PurlStatus> {
        if entry.files.is_empty() {
            return Err(PatchError::Input(format!("Patch for {} contains no files", purl)));
        }

        let plans = self.plan(purl, entry, package_dir)?;

        if let Some(plan) = plans.iter().find(|p| matches!(p.state, TargetState::Drifted(_))) {
            if let (DriftPolicy::Abort, TargetState::Drifted(actual)) = (self.config.drift_policy, &plan.state) {
                return Err(PatchError::Drift {
                    purl: purl.to_string(),
                    file: plan.name.to_string(),
                    expected: plan.record.before_hash.clone(),
                    actual: actual.clone(),
                });
            }
            warn!(%purl, file = %plan.name, "overwriting drifted file");
        }

        let (already, pending): (Vec<&FilePlan>, Vec<&FilePlan>) =
            plans.iter().partition(|p| p.state == TargetState::Patched);
        let already_patched: Vec<String> = already.iter().map(|p| p.name.to_string()).collect();
        if pending.is_empty() {
            debug!(%purl, "every file already patched");
            return Ok(PurlStatus::AlreadyApplied);
        }

        if dry_run {
            for plan in &pending {
                self.store.resolve(&plan.record.after_hash, plan.name)?;
            }
            return Ok(PurlStatus::WouldApply {
                files: pending.iter().map(|p| p.name.to_string()).collect(),
            });
        }

        let mut snapshots = Vec::with_capacity(pending.len());
        for plan in &pending {
            let content = std::fs::read(&plan.target)
                .io_context(|| format!("Failed to read {}", plan.target.display()))?;
            snapshots.push(FileSnapshot {
                file_name: plan.name.to_string(),
                target: plan.target.clone(),
                content,
                after_hash: plan.record.after_hash.clone(),
                mode: util::file_mode(&plan.target),
            });
        }
        let record = self.ledger.create(purl, &snapshots)?;

        let mut files_modified = Vec::with_capacity(pending.len());
        for (written, plan) in pending.iter().enumerate() {
            let result = self
                .store
                .read(&plan.record.after_hash, plan.name)
                .and_then(|data| util::write_atomic(&plan.target, &data));
            if let Err(e) = result {
                self.roll_back(&record, written);
                return Err(e);
            }
            files_modified.push(plan.name.to_string());
        }

        Ok(PurlStatus::Applied {
            backup_uuid: record.uuid,
            files_modified,
            files_already_patched: already_patched,
        })
    }

    /// Hash every target (in parallel) and classify it against its file record.
    fn plan<'m>(&self, purl: &str, entry: &'m PatchEntry, package_dir: &Path) -> Result<Vec<FilePlan<'m>>> {
        let results: Vec<Result<FilePlan<'m>>> = entry
            .files
            .par_iter()
            .map(|(name, record)| {
                let target = util::join_relative(package_dir, name);
                if !target.is_file() {
                    return Err(PatchError::MissingTargetFile {
                        purl: purl.to_string(),
                        file: name.clone(),
                        path: target,
                    });
                }
                let actual = util::hash_file(&target)?;
                let state = if actual == record.after_hash {
                    TargetState::Patched
                } else if actual == record.before_hash {
                    TargetState::Unpatched
                } else {
                    TargetState::Drifted(actual)
                };
                Ok(FilePlan {
                    name: name.as_str(),
                    record,
                    target,
                    state,
                })
            })
            .collect();
        results.into_iter().collect()
    }

    /// Restore the first `written` targets of `record` from its backup, newest first.
    /// The record is discarded only if every restore succeeded.
    fn roll_back(&self, record: &UndoRecord, written: usize) {
        let mut clean = true;
        for entry in record.restore_paths[..written].iter().rev() {
            let restored = self
                .ledger
                .read_backup(record, entry)
                .and_then(|data| util::write_atomic_with_mode(&entry.target, &data, entry.mode));
            if let Err(e) = restored {
                warn!(uuid = %record.uuid, target = %entry.target.display(), error = %e, "rollback failed");
                clean = false;
            }
        }
        if clean {
            if let Err(e) = self.ledger.discard(&record.uuid) {
                warn!(uuid = %record.uuid, error = %e, "failed to discard rolled-back backup");
            }
        } else {
            warn!(uuid = %record.uuid, purl = %record.purl, "backup kept for manual recovery");
        }
    }
}

/// Apply patches for `options.purls` (or every installed patched package).
pub fn apply_patches(
    config: &Config,
    resolver: &dyn PackageResolver,
    ledger: &dyn UndoLedger,
    options: &ApplyOptions,
) -> Result<ApplyReport> {
    Applier::new(config, resolver, ledger).run(options)
}
