pub mod apply;
pub mod blob_store;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod get;
pub mod ledger;
pub mod list;
pub mod manifest;
pub mod purl;
pub mod remove;
pub mod report;
pub mod resolver;
pub mod util;

pub use apply::{apply_patches, ApplyOptions, ApplyReport, PurlResult, PurlStatus};
pub use blob_store::{resolve_blob, BlobStore};
pub use cleanup::{cleanup_backups, CleanupOptions, CleanupResult};
pub use config::{Config, DriftPolicy};
pub use error::{PatchError, Result};
pub use get::{get_patch, GetResult};
pub use ledger::{FsLedger, MemoryLedger, UndoLedger, UndoRecord};
pub use list::{list_patches, PatchSummary};
pub use manifest::{load_manifest, Manifest};
pub use purl::Purl;
pub use remove::{remove_patch, RemoveResult};
pub use resolver::{FixedResolver, NodeModulesResolver, PackageResolver};
