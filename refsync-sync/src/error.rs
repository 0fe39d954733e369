//! Error types for refsync-sync.

use std::path::PathBuf;

use thiserror::Error;

/// Cycle-fatal errors. Per-record and per-message problems never surface here.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error on the fingerprint store, with annotated path for context.
    #[error("fingerprint store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error writing the fingerprint store.
    #[error("fingerprint store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another detection cycle holds the run-lock.
    #[error("a detection cycle is already running")]
    AlreadyRunning,

    /// A blocking store task panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(String),
}

/// The upstream source could not produce a snapshot. The cycle is skipped.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("upstream returned an unusable snapshot: {0}")]
    Invalid(String),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
