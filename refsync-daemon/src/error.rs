use std::path::PathBuf;

use thiserror::Error;

use crate::state::InvalidTransition;

/// Error surface for the daemon runtime and its subscribers.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] refsync_core::ConfigError),

    #[error("sync error: {0}")]
    Sync(#[from] refsync_sync::SyncError),

    #[error("broker error: {0}")]
    Broker(#[from] refsync_broker::BrokerError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("task failure: {0}")]
    Task(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

/// A downstream target rejected an operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetError {
    /// Worth retrying: timeouts, throttling, connection loss.
    #[error("transient target error: {0}")]
    Transient(String),

    /// Retrying cannot help: the target refused the data itself.
    #[error("permanent target error: {0}")]
    Permanent(String),
}

impl TargetError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TargetError::Transient(_))
    }
}
