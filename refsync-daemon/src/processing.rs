//! Processing records: which changes a consumer has already applied.
//!
//! The ledger is keyed by `(EntityId, key)` per consumer, where `key` is
//! [`ChangeRecord::ledger_key`]: the new fingerprint for upserts, a tombstone
//! for removals. Alongside the ledger each entity keeps a *head*, the most
//! recent change applied, so a redelivered older change can be recognised as
//! superseded.
//!
//! The file-backed store writes `<home>/.refsync/processing/<consumer>.json`
//! with the atomic `.tmp` + rename pattern on every applied change.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use refsync_core::{ChangeRecord, ConsumerId, EntityId};

use crate::error::{io_err, DaemonError};
use crate::paths::processing_path;

/// One applied change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub entity_id: EntityId,
    pub key: String,
    pub consumer_id: ConsumerId,
    pub applied_at: DateTime<Utc>,
    /// Cycle that produced the change. `None` for 1.x envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,
}

impl ProcessingRecord {
    pub fn for_change(consumer_id: &ConsumerId, change: &ChangeRecord) -> Self {
        Self {
            entity_id: change.entity_id.clone(),
            key: change.ledger_key(),
            consumer_id: consumer_id.clone(),
            applied_at: Utc::now(),
            detected_at: change.detected_at,
        }
    }
}

/// Per-consumer applied-change ledger.
pub trait ProcessingStore: Send + Sync {
    fn is_applied(&self, entity_id: &EntityId, key: &str) -> Result<bool, DaemonError>;

    /// Most recent change applied for `entity_id`.
    fn head(&self, entity_id: &EntityId) -> Result<Option<ProcessingRecord>, DaemonError>;

    fn record_applied(&self, record: ProcessingRecord) -> Result<(), DaemonError>;

    /// Forget ledger keys applied before `cutoff`, except each entity's head.
    /// Entities whose head is a removal applied before `cutoff` are dropped
    /// entirely.
    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, DaemonError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct EntityLedger {
    head: Option<ProcessingRecord>,
    #[serde(default)]
    applied: BTreeMap<String, DateTime<Utc>>,
}

type Ledger = BTreeMap<EntityId, EntityLedger>;

fn record_into(ledger: &mut Ledger, record: ProcessingRecord) {
    let entry = ledger.entry(record.entity_id.clone()).or_default();
    entry.applied.insert(record.key.clone(), record.applied_at);
    let newer = match (&entry.head, record.detected_at) {
        (None, _) | (_, None) => true,
        (Some(head), Some(detected_at)) => head.detected_at.map_or(true, |h| h <= detected_at),
    };
    if newer {
        entry.head = Some(record);
    }
}

fn is_tombstone(key: &str) -> bool {
    key == "removed" || key.starts_with("removed:")
}

fn prune_ledger(ledger: &mut Ledger, cutoff: DateTime<Utc>) -> usize {
    let mut pruned = 0;
    ledger.retain(|_, entry| {
        let gone = entry
            .head
            .as_ref()
            .is_some_and(|h| is_tombstone(&h.key) && h.applied_at < cutoff);
        if gone {
            pruned += entry.applied.len().max(1);
        }
        !gone
    });
    for entry in ledger.values_mut() {
        let head_key = entry.head.as_ref().map(|h| h.key.clone());
        let before = entry.applied.len();
        entry
            .applied
            .retain(|key, applied_at| *applied_at >= cutoff || Some(key) == head_key.as_ref());
        pruned += before - entry.applied.len();
    }
    pruned
}

fn lookup_applied(ledger: &Ledger, entity_id: &EntityId, key: &str) -> bool {
    ledger
        .get(entity_id)
        .map(|e| e.applied.contains_key(key))
        .unwrap_or(false)
}

fn lookup_head(ledger: &Ledger, entity_id: &EntityId) -> Option<ProcessingRecord> {
    ledger.get(entity_id).and_then(|e| e.head.clone())
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryProcessingStore {
    ledger: Mutex<Ledger>,
}

impl MemoryProcessingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl ProcessingStore for MemoryProcessingStore {
    fn is_applied(&self, entity_id: &EntityId, key: &str) -> Result<bool, DaemonError> {
        Ok(lookup_applied(&self.lock(), entity_id, key))
    }

    fn head(&self, entity_id: &EntityId) -> Result<Option<ProcessingRecord>, DaemonError> {
        Ok(lookup_head(&self.lock(), entity_id))
    }

    fn record_applied(&self, record: ProcessingRecord) -> Result<(), DaemonError> {
        record_into(&mut self.lock(), record);
        Ok(())
    }

    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, DaemonError> {
        Ok(prune_ledger(&mut self.lock(), cutoff))
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct ProcessingFile {
    consumer: ConsumerId,
    entities: Ledger,
}

/// JSON file store, loaded once and written through on every change.
#[derive(Debug)]
pub struct FileProcessingStore {
    path: PathBuf,
    consumer: ConsumerId,
    ledger: Mutex<Ledger>,
}

impl FileProcessingStore {
    /// Open (or start) the ledger for `consumer` under `home`.
    pub fn open(home: &Path, consumer: &ConsumerId) -> Result<Self, DaemonError> {
        Self::open_path(processing_path(home, consumer), consumer)
    }

    pub fn open_path(path: impl Into<PathBuf>, consumer: &ConsumerId) -> Result<Self, DaemonError> {
        let path = path.into();
        let ledger = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<ProcessingFile>(&contents) {
                Ok(file) => file.entities,
                Err(err) => {
                    // Losing the ledger only means re-applying idempotent changes.
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "processing store unreadable; starting empty",
                    );
                    Ledger::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Ledger::new(),
            Err(err) => return Err(io_err(&path, err)),
        };
        Ok(Self {
            path,
            consumer: consumer.clone(),
            ledger: Mutex::new(ledger),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn save(&self, ledger: &Ledger) -> Result<(), DaemonError> {
        let Some(dir) = self.path.parent() else {
            return Err(io_err(
                &self.path,
                std::io::Error::other("invalid processing store path"),
            ));
        };
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let file = ProcessingFile {
            consumer: self.consumer.clone(),
            entities: ledger.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&self.path, e));
        }
        Ok(())
    }
}

impl ProcessingStore for FileProcessingStore {
    fn is_applied(&self, entity_id: &EntityId, key: &str) -> Result<bool, DaemonError> {
        Ok(lookup_applied(&self.lock(), entity_id, key))
    }

    fn head(&self, entity_id: &EntityId) -> Result<Option<ProcessingRecord>, DaemonError> {
        Ok(lookup_head(&self.lock(), entity_id))
    }

    fn record_applied(&self, record: ProcessingRecord) -> Result<(), DaemonError> {
        let mut ledger = self.lock();
        let mut next = ledger.clone();
        record_into(&mut next, record);
        self.save(&next)?;
        *ledger = next;
        Ok(())
    }

    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, DaemonError> {
        let mut ledger = self.lock();
        let mut next = ledger.clone();
        let pruned = prune_ledger(&mut next, cutoff);
        if pruned > 0 {
            self.save(&next)?;
            *ledger = next;
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn applied(entity: &str, key: &str, detected_at: Option<DateTime<Utc>>) -> ProcessingRecord {
        ProcessingRecord {
            entity_id: EntityId::from(entity),
            key: key.to_string(),
            consumer_id: ConsumerId::from("calendar"),
            applied_at: Utc::now(),
            detected_at,
        }
    }

    #[test]
    fn head_tracks_latest_detected_change() {
        let store = MemoryProcessingStore::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(300);
        store.record_applied(applied("M1", "f2", Some(t1))).unwrap();
        store.record_applied(applied("M1", "f1", Some(t0))).unwrap();

        let head = store.head(&EntityId::from("M1")).unwrap().unwrap();
        assert_eq!(head.key, "f2");
        assert!(store.is_applied(&EntityId::from("M1"), "f1").unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let home = TempDir::new().unwrap();
        let consumer = ConsumerId::from("contacts");
        let store = FileProcessingStore::open(home.path(), &consumer).unwrap();
        store.record_applied(applied("M1", "f1", None)).unwrap();
        assert!(store.path().ends_with("processing/contacts.json"));

        let reopened = FileProcessingStore::open(home.path(), &consumer).unwrap();
        assert!(reopened.is_applied(&EntityId::from("M1"), "f1").unwrap());
        assert!(!reopened.is_applied(&EntityId::from("M1"), "f2").unwrap());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let home = TempDir::new().unwrap();
        let consumer = ConsumerId::from("calendar");
        let path = processing_path(home.path(), &consumer);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[[[").unwrap();
        let store = FileProcessingStore::open(home.path(), &consumer).unwrap();
        assert!(store.head(&EntityId::from("M1")).unwrap().is_none());
    }

    #[test]
    fn prune_keeps_head_key() {
        let store = MemoryProcessingStore::new();
        let old = Utc::now() - Duration::days(60);
        let mut first = applied("M1", "f1", Some(old));
        first.applied_at = old;
        let mut second = applied("M1", "f2", Some(old + Duration::seconds(1)));
        second.applied_at = old;
        store.record_applied(first).unwrap();
        store.record_applied(second).unwrap();

        let pruned = store.prune(Utc::now() - Duration::days(30)).unwrap();
        assert_eq!(pruned, 1);
        assert!(!store.is_applied(&EntityId::from("M1"), "f1").unwrap());
        assert!(store.is_applied(&EntityId::from("M1"), "f2").unwrap());
    }

    #[test]
    fn prune_drops_entities_removed_before_cutoff() {
        let store = MemoryProcessingStore::new();
        let old = Utc::now() - Duration::days(60);
        for (entity, key) in [("M1", "f1"), ("M1", "removed:f1"), ("M2", "f2")] {
            let mut record = applied(entity, key, Some(old));
            record.applied_at = old;
            store.record_applied(record).unwrap();
        }
        let mut recent = applied("M3", "removed:f3", Some(Utc::now()));
        recent.applied_at = Utc::now();
        store.record_applied(recent).unwrap();

        let pruned = store.prune(Utc::now() - Duration::days(30)).unwrap();
        assert_eq!(pruned, 2);
        assert!(store.head(&EntityId::from("M1")).unwrap().is_none());
        assert!(store.is_applied(&EntityId::from("M2"), "f2").unwrap());
        assert!(store.head(&EntityId::from("M3")).unwrap().is_some());
    }
}
