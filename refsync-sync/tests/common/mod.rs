#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use refsync_broker::{Broker, BrokerError, Delivery, GroupLag, MemoryBroker, Subscription};
use refsync_core::config::{BrokerConfig, PublishConfig};
use refsync_core::{MessageId, Tier};
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
        "notes": "bring spare flags",
        "assignees": [],
        "contacts": [{"name": "C. Coach", "phone": "+44 1234"}]
    })
}

pub fn publish_config() -> PublishConfig {
    PublishConfig {
        timeout_ms: 500,
        retries: 1,
        retry_delay_ms: 10,
        batch_size: 1,
    }
}

/// Snapshot source whose contents the test swaps between cycles.
#[derive(Default)]
pub struct ScriptedSource {
    snapshot: Mutex<Option<Vec<Value>>>,
}

impl ScriptedSource {
    pub fn new(snapshot: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(Some(snapshot)),
        })
    }

    pub fn set(&self, snapshot: Vec<Value>) {
        *self.snapshot.lock().unwrap() = Some(snapshot);
    }

    /// Make the next fetches fail.
    pub fn go_down(&self) {
        *self.snapshot.lock().unwrap() = None;
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn fetch(&self) -> Result<Vec<Value>, SourceError> {
        self.snapshot
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SourceError::Unavailable("connection refused".to_string()))
    }
}

/// Durable broker that can be switched off.
pub struct SwitchableBroker {
    pub inner: MemoryBroker,
    down: AtomicBool,
}

impl SwitchableBroker {
    pub fn durable() -> Arc<Self> {
        Self::wrap(MemoryBroker::durable(&BrokerConfig::default()))
    }

    pub fn wrap(inner: MemoryBroker) -> Arc<Self> {
        Arc::new(Self {
            inner,
            down: AtomicBool::new(false),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl Broker for SwitchableBroker {
    fn tier(&self) -> Tier {
        self.inner.tier()
    }

    async fn append_bytes(&self, key: &str, body: Vec<u8>) -> Result<MessageId, BrokerError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BrokerError::unavailable("broker offline"));
        }
        self.inner.append_bytes(key, body).await
    }

    async fn subscribe(&self, group: &str, consumer: &str) -> Result<Subscription, BrokerError> {
        self.inner.subscribe(group, consumer).await
    }

    async fn ack(&self, group: &str, id: &MessageId) -> Result<(), BrokerError> {
        self.inner.ack(group, id).await
    }

    async fn pending(&self, group: &str, older: Duration) -> Result<Vec<MessageId>, BrokerError> {
        self.inner.pending(group, older).await
    }

    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<Delivery>, BrokerError> {
        self.inner.claim(group, consumer, min_idle, ids).await
    }

    async fn lag(&self, group: &str) -> Result<GroupLag, BrokerError> {
        self.inner.lag(group).await
    }
}
