//! Error types for refsync-core.

use std::path::PathBuf;

use thiserror::Error;

/// A single upstream record failed validation at the ingestion boundary.
///
/// The record is skipped; the rest of the snapshot is still processed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    /// The payload is not a JSON object.
    #[error("record is not a JSON object")]
    NotAnObject,

    /// A required field is absent or empty.
    #[error("record {id}: missing required field `{field}`")]
    MissingField { id: String, field: &'static str },

    /// A field is present but does not satisfy the schema.
    #[error("record {id}: invalid field `{field}`: {reason}")]
    InvalidField {
        id: String,
        field: String,
        reason: String,
    },
}

impl RecordError {
    /// The record id, when it could be read.
    pub fn record_id(&self) -> Option<&str> {
        match self {
            RecordError::NotAnObject => None,
            RecordError::MissingField { id, .. } | RecordError::InvalidField { id, .. } => {
                if id.is_empty() {
                    None
                } else {
                    Some(id.as_str())
                }
            }
        }
    }
}

/// Errors decoding or encoding a message envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Body is not valid JSON or does not match the envelope schema.
    #[error("envelope JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// `schemaVersion` is missing or not of the form `major.minor`.
    #[error("invalid schema version {raw:?}")]
    InvalidVersion { raw: String },

    /// `schemaVersion` is well-formed but outside the supported range.
    #[error("unsupported schema version {found} (supported majors {min_major}..={max_major})")]
    UnsupportedVersion {
        found: String,
        min_major: u16,
        max_major: u16,
    },
}

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load, with the file path.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A value parsed but is out of range.
    #[error("invalid config value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}
