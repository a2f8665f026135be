use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = PatchError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("{what} not found: {}", .path.display())]
    NotFound { what: &'static str, path: PathBuf },

    #[error("Failed to parse manifest {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid manifest {}: {}", .path.display(), .violations.join("; "))]
    Schema {
        path: PathBuf,
        violations: Vec<String>,
    },

    #[error("{0}")]
    Input(String),

    #[error("Blob {hash} for file {file} not found in blob store")]
    BlobNotFound { hash: String, file: String },

    #[error("Content of {file} does not match hash {expected} (got {actual})")]
    BlobCorrupt {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("Package {purl} is not installed under {}", .root.display())]
    PackageNotFound { purl: String, root: PathBuf },

    #[error("Patch target {file} of {purl} is missing: {}", .path.display())]
    MissingTargetFile {
        purl: String,
        file: String,
        path: PathBuf,
    },

    #[error("File {file} of {purl} has drifted: expected {expected}, found {actual}")]
    Drift {
        purl: String,
        file: String,
        expected: String,
        actual: String,
    },

    #[error("Restored {restored} of {total} files for {purl}, {} pending: {source}", .total - .restored)]
    RestoreIncomplete {
        purl: String,
        restored: usize,
        total: usize,
        #[source]
        source: Box<PatchError>,
    },

    #[error("Backup ledger error: {0}")]
    Ledger(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PatchError {
    /// Stable error code reported to the presentation layer.
    pub fn kind(&self) -> &'static str {
        match self {
            PatchError::NotFound { .. } => "NotFoundError",
            PatchError::Parse { .. } => "ParseError",
            PatchError::Schema { .. } => "SchemaError",
            PatchError::Input(_) => "InputError",
            PatchError::BlobNotFound { .. } => "BlobNotFoundError",
            PatchError::BlobCorrupt { .. } => "BlobCorruptError",
            PatchError::PackageNotFound { .. } => "PackageNotFoundError",
            PatchError::MissingTargetFile { .. } => "MissingTargetFileError",
            PatchError::Drift { .. } => "DriftError",
            PatchError::RestoreIncomplete { .. } => "RestoreIncompleteError",
            PatchError::Ledger(_) => "LedgerError",
            PatchError::Io { .. } => "IoError",
        }
    }
}

/// Attach a path-and-action description to raw I/O errors.
pub trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| PatchError::Io {
            context: f().into(),
            source,
        })
    }
}
