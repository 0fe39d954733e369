//! One detection cycle: fetch → detect → publish → commit.
//!
//! Fingerprints are committed strictly after publication and only for
//! entities the publisher reports as committable, so a failed publish leaves
//! the old fingerprint in place and the change is detected again next cycle.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use refsync_core::{ChangeType, EntityId};

use crate::detector::{detect, DetectMode};
use crate::error::{SourceError, SyncError};
use crate::fingerprint_store::{FingerprintMap, FingerprintStore, FingerprintUpdate};
use crate::publisher::Publisher;

/// Produces the complete current snapshot of upstream records.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<Value>, SourceError>;
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Every change was handed off and committed.
    Clean,
    /// Some durable publishes failed; those entities kept their old fingerprint.
    PartiallyFailed,
    /// Nothing was detected or committed.
    Skipped { reason: String },
}

/// Summary of one cycle, for logs and the operator status view.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub mode: &'static str,
    pub outcome: CycleOutcome,
    pub fetched: usize,
    pub new: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub skipped_records: usize,
    pub envelopes: usize,
    pub committed: usize,
    pub failed: Vec<EntityId>,
    pub duration_ms: u64,
}

impl CycleReport {
    fn skipped(
        started_at: DateTime<Utc>,
        mode: DetectMode,
        reason: String,
        clock: Instant,
    ) -> Self {
        Self {
            started_at,
            mode: mode_name(mode),
            outcome: CycleOutcome::Skipped { reason },
            fetched: 0,
            new: 0,
            updated: 0,
            removed: 0,
            unchanged: 0,
            skipped_records: 0,
            envelopes: 0,
            committed: 0,
            failed: Vec::new(),
            duration_ms: clock.elapsed().as_millis() as u64,
        }
    }
}

fn mode_name(mode: DetectMode) -> &'static str {
    match mode {
        DetectMode::Incremental => "incremental",
        DetectMode::ForceResync => "force_resync",
    }
}

/// Runs detection cycles; at most one at a time.
pub struct CycleRunner {
    source: Arc<dyn SnapshotSource>,
    store: Arc<dyn FingerprintStore>,
    publisher: Publisher,
    lock: Mutex<()>,
}

impl CycleRunner {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        store: Arc<dyn FingerprintStore>,
        publisher: Publisher,
    ) -> Self {
        Self {
            source,
            store,
            publisher,
            lock: Mutex::new(()),
        }
    }

    /// Run one cycle.
    ///
    /// Returns [`SyncError::AlreadyRunning`] if another cycle holds the
    /// run-lock, and any other error only when the fingerprint store itself
    /// cannot be read or written.
    pub async fn run(&self, mode: DetectMode) -> Result<CycleReport, SyncError> {
        let Ok(_guard) = self.lock.try_lock() else {
            return Err(SyncError::AlreadyRunning);
        };
        let clock = Instant::now();
        let started_at = Utc::now();

        let snapshot = match self.source.fetch().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "snapshot fetch failed; skipping cycle");
                return Ok(CycleReport::skipped(started_at, mode, err.to_string(), clock));
            }
        };

        let stored = self.load_store().await?;
        let change_set = detect(&snapshot, &stored, mode);
        tracing::info!(
            fetched = snapshot.len(),
            new = change_set.count(ChangeType::New),
            updated = change_set.count(ChangeType::Updated),
            removed = change_set.count(ChangeType::Removed),
            unchanged = change_set.unchanged,
            skipped = change_set.skipped.len(),
            mode = mode_name(mode),
            "change-set detected",
        );

        let publish = self.publisher.publish(&change_set).await;

        let committable = publish.committable();
        let updates: Vec<FingerprintUpdate> = change_set
            .entries
            .iter()
            .filter(|e| committable.contains(&e.entity_id))
            .map(|e| e.fingerprint_update())
            .collect();
        let committed = updates.len();
        if !updates.is_empty() {
            self.commit_store(updates).await?;
        }

        let outcome = if publish.is_partial() {
            CycleOutcome::PartiallyFailed
        } else {
            CycleOutcome::Clean
        };

        let report = CycleReport {
            started_at,
            mode: mode_name(mode),
            outcome,
            fetched: snapshot.len(),
            new: change_set.count(ChangeType::New),
            updated: change_set.count(ChangeType::Updated),
            removed: change_set.count(ChangeType::Removed),
            unchanged: change_set.unchanged,
            skipped_records: change_set.skipped.len(),
            envelopes: publish.envelopes,
            committed,
            failed: publish.failed.clone(),
            duration_ms: clock.elapsed().as_millis() as u64,
        };
        match report.outcome {
            CycleOutcome::PartiallyFailed => tracing::warn!(
                failed = report.failed.len(),
                committed,
                duration_ms = report.duration_ms,
                "cycle partially failed",
            ),
            _ => tracing::info!(
                committed,
                envelopes = report.envelopes,
                duration_ms = report.duration_ms,
                "cycle complete",
            ),
        }
        Ok(report)
    }

    async fn load_store(&self) -> Result<FingerprintMap, SyncError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?
    }

    async fn commit_store(&self, updates: Vec<FingerprintUpdate>) -> Result<(), SyncError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.commit(&updates))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?
    }
}
