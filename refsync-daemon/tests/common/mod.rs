#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refsync_broker::Broker;
use refsync_core::config::ConsumerConfig;
use refsync_core::{ChangeRecord, ChangeType, EntityId, EntityRecord, Envelope, Fingerprint};
use refsync_daemon::{Alert, AlertSink, MemoryTarget, Target, TargetError};
use refsync_sync::{SnapshotSource, SourceError};
use serde_json::{json, Value};

pub fn record(id: &str) -> Value {
    json!({
        "id": id,
        "homeTeam": "Rovers",
        "awayTeam": "United",
        "venue": {"name": "North Field", "address": "1 Park Lane"},
        "startsAt": "2025-09-27T14:00:00Z",
        "endsAt": "2025-09-27T16:00:00Z",
        "competition": "U14 League",
        "assignees": [],
        "contacts": [{"name": "C. Coach", "phone": "+44 1234"}]
    })
}

pub fn officials() -> Value {
    json!([
        {"name": "A. Ref", "role": "referee"},
        {"name": "B. Line", "role": "assistant"},
        {"name": "C. Line", "role": "assistant"}
    ])
}

/// Consumer settings with millisecond backoff.
pub fn consumer_config(max_attempts: u32) -> ConsumerConfig {
    ConsumerConfig {
        workers: 2,
        max_attempts,
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
        reclaim_interval_secs: 1,
        ..ConsumerConfig::default()
    }
}

/// An upsert of `record` as detected at `detected_at`.
pub fn upsert(
    change_type: ChangeType,
    record: &Value,
    fingerprint: &str,
    detected_at: DateTime<Utc>,
) -> ChangeRecord {
    let record = EntityRecord::from_value(record).unwrap();
    ChangeRecord {
        entity_id: record.id.clone(),
        change_type,
        old_fingerprint: None,
        new_fingerprint: Some(Fingerprint::from(fingerprint.repeat(64))),
        detected_at: Some(detected_at),
        forced: false,
        record: Some(record),
    }
}

pub async fn publish(broker: &dyn Broker, changes: Vec<ChangeRecord>) {
    broker
        .append(&Envelope::new("change-detector", changes, false))
        .await
        .unwrap();
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `group` has read and acknowledged everything.
pub async fn drained(broker: &dyn Broker, group: &str) {
    eventually(&format!("{group} to drain"), move || async move {
        let lag = broker.lag(group).await.unwrap();
        lag.unread == 0 && lag.pending == 0
    })
    .await;
}

/// Target that fails its first `failures` calls.
pub struct FlakyTarget {
    pub inner: MemoryTarget,
    failures: u32,
    permanent: bool,
    calls: AtomicU32,
}

impl FlakyTarget {
    pub fn transient(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryTarget::new(),
            failures,
            permanent: false,
            calls: AtomicU32::new(0),
        })
    }

    pub fn permanent() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryTarget::new(),
            failures: u32::MAX,
            permanent: true,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), TargetError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.failures {
            return Ok(());
        }
        if self.permanent {
            Err(TargetError::Permanent("422 invalid attendee".to_string()))
        } else {
            Err(TargetError::Transient("503 service unavailable".to_string()))
        }
    }
}

#[async_trait]
impl Target for FlakyTarget {
    async fn upsert(&self, key: &str, attributes: Value) -> Result<(), TargetError> {
        self.check()?;
        self.inner.upsert(key, attributes).await
    }

    async fn delete(&self, key: &str) -> Result<(), TargetError> {
        self.check()?;
        self.inner.delete(key).await
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn raised(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

impl AlertSink for RecordingAlerts {
    fn raise(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

/// Snapshot source whose contents the test swaps between cycles.
pub struct ScriptedSource {
    snapshot: Mutex<Vec<Value>>,
}

impl ScriptedSource {
    pub fn new(snapshot: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(snapshot),
        })
    }

    pub fn set(&self, snapshot: Vec<Value>) {
        *self.snapshot.lock().unwrap() = snapshot;
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn fetch(&self) -> Result<Vec<Value>, SourceError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }
}

pub fn entity(id: &str) -> EntityId {
    EntityId::from(id)
}
