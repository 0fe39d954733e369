//! Identifier newtypes and change classification shared by every crate.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::EntityRecord;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Stable upstream identifier of a tracked entity (a scheduled match).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Lowercase hex SHA-256 digest over an entity's change-relevant fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// A well-formed fingerprint is exactly 64 lowercase hex characters.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 64
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    /// First 12 characters, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identity of one logical downstream consumer (also its consumer-group name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(pub String);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ConsumerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConsumerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Broker-assigned identifier of one appended message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Change classification
// ---------------------------------------------------------------------------

/// Outcome of comparing an entity against its stored fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    New,
    Updated,
    Removed,
    Unchanged,
}

impl ChangeType {
    /// Whether consumers should upsert (as opposed to delete) for this change.
    pub fn is_upsert(&self) -> bool {
        matches!(self, ChangeType::New | ChangeType::Updated)
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::New => write!(f, "new"),
            ChangeType::Updated => write!(f, "updated"),
            ChangeType::Removed => write!(f, "removed"),
            ChangeType::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// One change-set entry, in the shape it travels inside an envelope payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub entity_id: EntityId,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_fingerprint: Option<Fingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_fingerprint: Option<Fingerprint>,
    /// Start of the detection cycle that produced this change. Absent in 1.x envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,
    /// Set by force-resync; consumers re-apply even when the ledger says applied.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub forced: bool,
    /// The validated record. `None` for removals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<EntityRecord>,
}

impl ChangeRecord {
    /// The idempotency key for this change: `(EntityId, key)` where `key` is the
    /// new fingerprint for upserts and a tombstone of the old one for removals.
    ///
    /// Removal keys are distinct from upsert keys so that an entity removed and
    /// re-added with identical content is applied again.
    pub fn ledger_key(&self) -> String {
        match (self.change_type, &self.new_fingerprint, &self.old_fingerprint) {
            (ChangeType::Removed, _, Some(old)) => format!("removed:{old}"),
            (ChangeType::Removed, _, None) => "removed".to_string(),
            (_, Some(new), _) => new.0.clone(),
            (_, None, _) => String::new(),
        }
    }
}
