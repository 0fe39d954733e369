//! Error types for refsync-broker.

use thiserror::Error;

use refsync_core::EnvelopeError;

/// Errors surfaced by a [`crate::Broker`] implementation.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The backing broker cannot be reached or refused the operation.
    #[error("broker unavailable: {reason}")]
    Unavailable { reason: String },

    /// An operation exceeded its deadline.
    #[error("broker {operation} timed out after {duration_ms}ms")]
    Timeout {
        operation: &'static str,
        duration_ms: u64,
    },

    /// The envelope could not be encoded.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
}

impl BrokerError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}
