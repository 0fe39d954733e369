//! Change detection.
//!
//! ## `detect`: classification rules
//!
//! 1. Validate and fingerprint every snapshot value; malformed values are
//!    skipped with a diagnostic and never abort the cycle.
//! 2. No stored fingerprint → `New`; stored differs → `Updated`; stored
//!    matches → `Unchanged` (counted, not emitted).
//! 3. Stored ids absent from the snapshot → `Removed`, unless the id belongs
//!    to a record that was present but skipped as malformed.
//! 4. `ForceResync` classifies every valid record as `Updated`.
//!
//! Nothing is committed here: the returned [`ChangeSet`] carries the
//! fingerprint updates for the cycle to commit after publication.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;

use refsync_core::{ChangeRecord, ChangeType, EntityId, EntityRecord, Fingerprint, RecordError};

use crate::fingerprint;
use crate::fingerprint_store::{FingerprintMap, FingerprintUpdate};

/// How stored fingerprints are consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectMode {
    /// Compare against stored fingerprints.
    #[default]
    Incremental,
    /// Operator-triggered full recovery: every present record is `Updated`.
    ForceResync,
}

/// One classified entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSetEntry {
    pub entity_id: EntityId,
    pub change_type: ChangeType,
    pub old_fingerprint: Option<Fingerprint>,
    pub new_fingerprint: Option<Fingerprint>,
    /// The validated record; `None` for removals.
    pub payload: Option<EntityRecord>,
}

impl ChangeSetEntry {
    /// Wire form of this entry.
    pub fn to_change_record(&self, detected_at: DateTime<Utc>, forced: bool) -> ChangeRecord {
        ChangeRecord {
            entity_id: self.entity_id.clone(),
            change_type: self.change_type,
            old_fingerprint: self.old_fingerprint.clone(),
            new_fingerprint: self.new_fingerprint.clone(),
            detected_at: Some(detected_at),
            forced,
            record: self.payload.clone(),
        }
    }

    /// The store update to commit once this entry has been handed off.
    pub fn fingerprint_update(&self) -> FingerprintUpdate {
        match (&self.change_type, &self.new_fingerprint) {
            (ChangeType::Removed, _) | (_, None) => FingerprintUpdate::Remove {
                entity_id: self.entity_id.clone(),
            },
            (_, Some(fingerprint)) => FingerprintUpdate::Set {
                entity_id: self.entity_id.clone(),
                fingerprint: fingerprint.clone(),
            },
        }
    }
}

/// A snapshot value that could not be fingerprinted.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRecord {
    /// Position in the snapshot.
    pub index: usize,
    pub entity_id: Option<EntityId>,
    pub error: RecordError,
}

/// Result of one detection pass.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub detected_at: DateTime<Utc>,
    pub mode: DetectMode,
    /// Emitted entries: present records in snapshot order, then removals by id.
    pub entries: Vec<ChangeSetEntry>,
    pub skipped: Vec<SkippedRecord>,
    pub unchanged: usize,
}

impl ChangeSet {
    pub fn count(&self, change_type: ChangeType) -> usize {
        self.entries
            .iter()
            .filter(|e| e.change_type == change_type)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fingerprint updates for every emitted entry, not yet committed.
    pub fn updates(&self) -> Vec<FingerprintUpdate> {
        self.entries
            .iter()
            .map(ChangeSetEntry::fingerprint_update)
            .collect()
    }
}

/// Classify a full snapshot against the stored fingerprints.
pub fn detect(snapshot: &[Value], stored: &FingerprintMap, mode: DetectMode) -> ChangeSet {
    let detected_at = Utc::now();
    let mut entries = Vec::new();
    let mut skipped = Vec::new();
    let mut unchanged = 0usize;
    let mut seen: HashSet<EntityId> = HashSet::new();

    for (index, value) in snapshot.iter().enumerate() {
        let (record, new_fp) = match fingerprint::compute_raw(value) {
            Ok(ok) => ok,
            Err(error) => {
                let entity_id = error.record_id().map(EntityId::from);
                tracing::warn!(
                    index,
                    entity = ?entity_id,
                    error = %error,
                    "skipping malformed record",
                );
                if let Some(id) = &entity_id {
                    seen.insert(id.clone());
                }
                skipped.push(SkippedRecord {
                    index,
                    entity_id,
                    error,
                });
                continue;
            }
        };

        let entity_id = record.id.clone();
        if !seen.insert(entity_id.clone()) {
            let error = RecordError::InvalidField {
                id: entity_id.0.clone(),
                field: "id".to_string(),
                reason: "duplicate id in snapshot".to_string(),
            };
            tracing::warn!(index, entity = %entity_id, "skipping duplicate record");
            skipped.push(SkippedRecord {
                index,
                entity_id: Some(entity_id),
                error,
            });
            continue;
        }

        let old_fp = stored.get(&entity_id).map(|s| s.fingerprint.clone());
        let change_type = match (mode, &old_fp) {
            (DetectMode::ForceResync, _) => ChangeType::Updated,
            (DetectMode::Incremental, None) => ChangeType::New,
            (DetectMode::Incremental, Some(old)) if *old != new_fp => ChangeType::Updated,
            (DetectMode::Incremental, Some(_)) => ChangeType::Unchanged,
        };

        if change_type == ChangeType::Unchanged {
            unchanged += 1;
            continue;
        }

        tracing::debug!(
            entity = %entity_id,
            change = %change_type,
            fingerprint = new_fp.short(),
            "classified",
        );
        entries.push(ChangeSetEntry {
            entity_id,
            change_type,
            old_fingerprint: old_fp,
            new_fingerprint: Some(new_fp),
            payload: Some(record),
        });
    }

    // BTreeMap iteration is already sorted by id.
    for (entity_id, stored_fp) in stored {
        if seen.contains(entity_id) {
            continue;
        }
        entries.push(ChangeSetEntry {
            entity_id: entity_id.clone(),
            change_type: ChangeType::Removed,
            old_fingerprint: Some(stored_fp.fingerprint.clone()),
            new_fingerprint: None,
            payload: None,
        });
    }

    ChangeSet {
        detected_at,
        mode,
        entries,
        skipped,
        unchanged,
    }
}
