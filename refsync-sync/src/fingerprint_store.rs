//! Fingerprint store: persisted `EntityId → fingerprint` mapping.
//!
//! The file-backed store persists a JSON document at
//! `<home>/.refsync/fingerprints.json`. Commits use the atomic `.tmp` + rename
//! pattern so a crash mid-commit leaves the previous cycle's state intact.
//!
//! Loading is deliberately forgiving: an unparseable file or a malformed entry
//! is treated as "no prior fingerprint", which re-delivers the entity instead
//! of silently suppressing its changes. Only an unreadable file is an error.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use refsync_core::{EntityId, Fingerprint};

use crate::error::{io_err, SyncError};

/// A stored fingerprint and when it was last written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFingerprint {
    pub fingerprint: Fingerprint,
    pub updated_at: DateTime<Utc>,
}

/// In-memory view of the store.
pub type FingerprintMap = BTreeMap<EntityId, StoredFingerprint>;

/// One pending change to the store, produced by detection and applied by commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintUpdate {
    Set {
        entity_id: EntityId,
        fingerprint: Fingerprint,
    },
    Remove {
        entity_id: EntityId,
    },
}

impl FingerprintUpdate {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            FingerprintUpdate::Set { entity_id, .. } | FingerprintUpdate::Remove { entity_id } => {
                entity_id
            }
        }
    }
}

/// Key-value store for fingerprints. Only the detection cycle writes to it.
pub trait FingerprintStore: Send + Sync {
    /// Every stored fingerprint.
    fn load(&self) -> Result<FingerprintMap, SyncError>;

    /// Apply a whole cycle's updates atomically.
    fn commit(&self, updates: &[FingerprintUpdate]) -> Result<(), SyncError>;
}

fn apply(map: &mut FingerprintMap, updates: &[FingerprintUpdate], now: DateTime<Utc>) {
    for update in updates {
        match update {
            FingerprintUpdate::Set {
                entity_id,
                fingerprint,
            } => {
                map.insert(
                    entity_id.clone(),
                    StoredFingerprint {
                        fingerprint: fingerprint.clone(),
                        updated_at: now,
                    },
                );
            }
            FingerprintUpdate::Remove { entity_id } => {
                map.remove(entity_id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryFingerprintStore {
    map: Mutex<FingerprintMap>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FingerprintStore for MemoryFingerprintStore {
    fn load(&self) -> Result<FingerprintMap, SyncError> {
        Ok(self.map.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn commit(&self, updates: &[FingerprintUpdate]) -> Result<(), SyncError> {
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        apply(&mut map, updates, Utc::now());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// On-disk payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FingerprintStoreFile {
    pub synced_at: DateTime<Utc>,
    pub entities: BTreeMap<String, StoredFingerprint>,
}

/// Path to the fingerprint store JSON, rooted at `home`.
///
/// `~/.refsync/fingerprints.json`
pub fn store_path_at(home: &Path) -> PathBuf {
    home.join(".refsync").join("fingerprints.json")
}

/// JSON file store.
#[derive(Debug)]
pub struct FileFingerprintStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileFingerprintStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store at the default location under `home`.
    pub fn at(home: &Path) -> Self {
        Self::new(store_path_at(home))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, map: &FingerprintMap) -> Result<(), SyncError> {
        let Some(dir) = self.path.parent() else {
            return Err(io_err(
                &self.path,
                std::io::Error::other("invalid fingerprint store path"),
            ));
        };
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let file = FingerprintStoreFile {
            synced_at: Utc::now(),
            entities: map
                .iter()
                .map(|(id, stored)| (id.0.clone(), stored.clone()))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&self.path, e));
        }
        Ok(())
    }
}

impl FingerprintStore for FileFingerprintStore {
    fn load(&self) -> Result<FingerprintMap, SyncError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(FingerprintMap::new()),
            Err(err) => return Err(io_err(&self.path, err)),
        };
        Ok(parse_store(&self.path, &contents))
    }

    fn commit(&self, updates: &[FingerprintUpdate]) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut map = self.load()?;
        apply(&mut map, updates, Utc::now());
        self.save(&map)?;
        tracing::debug!(
            path = %self.path.display(),
            updates = updates.len(),
            tracked = map.len(),
            "committed fingerprints",
        );
        Ok(())
    }
}

/// Parse entry by entry, dropping anything that is not a well-formed fingerprint.
///
/// Accepts the structured `{synced_at, entities: {id: {fingerprint, updated_at}}}`
/// layout and the legacy flat `{id: digest}` map.
fn parse_store(path: &Path, contents: &str) -> FingerprintMap {
    let mut map = FingerprintMap::new();
    let value: Value = match serde_json::from_str(contents) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "fingerprint store unreadable; treating every entity as unseen",
            );
            return map;
        }
    };

    let Value::Object(mut root) = value else {
        tracing::warn!(path = %path.display(), "fingerprint store is not an object; ignoring");
        return map;
    };
    let (entries, legacy) = match root.remove("entities") {
        Some(Value::Object(entities)) => (entities, false),
        Some(_) => {
            tracing::warn!(
                path = %path.display(),
                "fingerprint store entities malformed; ignoring",
            );
            return map;
        }
        None => (root, true),
    };

    let now = Utc::now();
    let mut dropped = 0usize;
    for (id, entry) in entries {
        let stored = if legacy {
            entry.as_str().map(|digest| StoredFingerprint {
                fingerprint: Fingerprint::from(digest),
                updated_at: now,
            })
        } else {
            serde_json::from_value::<StoredFingerprint>(entry).ok()
        };
        match stored {
            Some(stored) if stored.fingerprint.is_well_formed() && !id.is_empty() => {
                map.insert(EntityId(id), stored);
            }
            _ => dropped += 1,
        }
    }
    if dropped > 0 {
        tracing::warn!(
            path = %path.display(),
            dropped,
            "dropped corrupted fingerprint entries; affected entities will be re-delivered",
        );
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fp(c: char) -> Fingerprint {
        Fingerprint(c.to_string().repeat(64))
    }

    fn set(id: &str, c: char) -> FingerprintUpdate {
        FingerprintUpdate::Set {
            entity_id: EntityId::from(id),
            fingerprint: fp(c),
        }
    }

    #[test]
    fn empty_store_when_file_missing() {
        let tmp = TempDir::new().unwrap();
        let store = FileFingerprintStore::at(tmp.path());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn commit_then_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = FileFingerprintStore::at(tmp.path());
        store.commit(&[set("M1", 'a'), set("M2", 'b')]).unwrap();
        store
            .commit(&[
                set("M1", 'c'),
                FingerprintUpdate::Remove {
                    entity_id: EntityId::from("M2"),
                },
            ])
            .unwrap();

        let map = store.load().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&EntityId::from("M1")].fingerprint, fp('c'));
    }

    #[test]
    fn tmp_file_cleaned_up_after_commit() {
        let tmp = TempDir::new().unwrap();
        let store = FileFingerprintStore::at(tmp.path());
        store.commit(&[set("M1", 'a')]).unwrap();
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn garbage_file_is_treated_as_empty() {
        let tmp = TempDir::new().unwrap();
        let store = FileFingerprintStore::at(tmp.path());
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn corrupted_entries_are_dropped_individually() {
        let tmp = TempDir::new().unwrap();
        let store = FileFingerprintStore::at(tmp.path());
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        let good = "a".repeat(64);
        std::fs::write(
            store.path(),
            format!(
                r#"{{"synced_at":"2025-09-26T10:00:00Z","entities":{{
                    "M1":{{"fingerprint":"{good}","updated_at":"2025-09-26T10:00:00Z"}},
                    "M2":{{"fingerprint":"short","updated_at":"2025-09-26T10:00:00Z"}},
                    "M3":{{"fingerprint":7}}
                }}}}"#
            ),
        )
        .unwrap();
        let map = store.load().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&EntityId::from("M1")));
    }

    #[test]
    fn load_legacy_flat_map_migrates_to_structured_store() {
        let tmp = TempDir::new().unwrap();
        let store = FileFingerprintStore::at(tmp.path());
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        let digest = "b".repeat(64);
        std::fs::write(store.path(), format!(r#"{{"M9":"{digest}"}}"#)).unwrap();

        let map = store.load().unwrap();
        assert_eq!(map[&EntityId::from("M9")].fingerprint.0, digest);

        store.commit(&[]).unwrap();
        let rewritten = std::fs::read_to_string(store.path()).unwrap();
        assert!(rewritten.contains("\"entities\""));
    }

    #[test]
    fn memory_store_commit_is_visible_to_load() {
        let store = MemoryFingerprintStore::new();
        store.commit(&[set("M1", 'a')]).unwrap();
        assert_eq!(store.load().unwrap().len(), 1);
    }
}
