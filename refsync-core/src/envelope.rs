//! Versioned message envelope.
//!
//! Wire shape:
//!
//! ```text
//! {"schemaVersion":"2.0","messageID":"...","timestamp":"2025-09-26T10:30:00Z",
//!  "source":"change-detector","payload":{"matches":[...],"metadata":{"count":N,...}}}
//! ```
//!
//! Decoding is two-step: [`Envelope::decode`] first reads only `schemaVersion`
//! and rejects versions outside [`SupportedVersions`] before attempting the
//! typed payload, so a message from a newer producer is reported as a version
//! problem rather than a confusing field error.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EnvelopeError;
use crate::types::ChangeRecord;

/// Default `source` stamped on envelopes by the change detector.
pub const DEFAULT_SOURCE: &str = "change-detector";

// ---------------------------------------------------------------------------
// Schema version
// ---------------------------------------------------------------------------

/// `major.minor` schema version. Minor bumps only add optional fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion {
    pub major: u16,
    pub minor: u16,
}

impl SchemaVersion {
    /// Version written by this build.
    pub const CURRENT: SchemaVersion = SchemaVersion { major: 2, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for SchemaVersion {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EnvelopeError::InvalidVersion { raw: s.to_string() };
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusive range of schema major versions a consumer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedVersions {
    pub min_major: u16,
    pub max_major: u16,
}

impl Default for SupportedVersions {
    fn default() -> Self {
        Self {
            min_major: 1,
            max_major: SchemaVersion::CURRENT.major,
        }
    }
}

impl SupportedVersions {
    pub fn contains(&self, version: SchemaVersion) -> bool {
        (self.min_major..=self.max_major).contains(&version.major)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Payload bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadMetadata {
    pub count: usize,
    #[serde(default = "Utc::now")]
    pub processed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_resync: bool,
}

/// Envelope payload: one or more change records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub matches: Vec<ChangeRecord>,
    pub metadata: PayloadMetadata,
}

/// Canonical wire representation of a batch of changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub schema_version: SchemaVersion,
    #[serde(rename = "messageID")]
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: Payload,
}

impl Envelope {
    /// Wrap change records in a current-version envelope with a fresh UUIDv7 id.
    pub fn new(source: impl Into<String>, matches: Vec<ChangeRecord>, force_resync: bool) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SchemaVersion::CURRENT,
            message_id: Uuid::now_v7().to_string(),
            timestamp: now,
            source: source.into(),
            payload: Payload {
                metadata: PayloadMetadata {
                    count: matches.len(),
                    processed_at: now,
                    force_resync,
                },
                matches,
            },
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Read only the `schemaVersion` of a raw body.
    pub fn peek_version(bytes: &[u8]) -> Result<SchemaVersion, EnvelopeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let raw = value
            .get("schemaVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| EnvelopeError::InvalidVersion {
                raw: value
                    .get("schemaVersion")
                    .map(Value::to_string)
                    .unwrap_or_default(),
            })?;
        raw.parse()
    }

    /// Decode a raw body, rejecting versions outside `supported`.
    pub fn decode(bytes: &[u8], supported: SupportedVersions) -> Result<Self, EnvelopeError> {
        let version = Self::peek_version(bytes)?;
        if !supported.contains(version) {
            return Err(EnvelopeError::UnsupportedVersion {
                found: version.to_string(),
                min_major: supported.min_major,
                max_major: supported.max_major,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Key used to route an envelope to one member of a consumer group.
    pub fn partition_key(&self) -> &str {
        self.payload
            .matches
            .first()
            .map(|m| m.entity_id.0.as_str())
            .unwrap_or(self.message_id.as_str())
    }
}
