//! Publication of a change-set through the broker.
//!
//! The publisher never fails a cycle. Each envelope gets a bounded append; on
//! the durable tier a failed append is retried a configured number of times,
//! on the best-effort tier a failure is an accepted loss. The returned
//! [`PublishReport`] tells the cycle which entities may have their
//! fingerprints committed.

use std::collections::HashSet;
use std::sync::Arc;

use refsync_broker::{Broker, BrokerError};
use refsync_core::config::PublishConfig;
use refsync_core::{EntityId, Envelope, MessageId, Tier};

use crate::detector::{ChangeSet, DetectMode};

/// Outcome of publishing one change-set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Envelopes built.
    pub envelopes: usize,
    /// Entities whose envelope the broker accepted.
    pub handed_off: Vec<EntityId>,
    /// Entities whose envelope could not be stored on the durable tier.
    pub failed: Vec<EntityId>,
    /// Entities whose best-effort publish failed. The loss is accepted.
    pub dropped: Vec<EntityId>,
    pub message_ids: Vec<MessageId>,
}

impl PublishReport {
    /// Entities whose fingerprint may be committed: handed off, or attempted
    /// on the best-effort tier.
    pub fn committable(&self) -> HashSet<&EntityId> {
        self.handed_off.iter().chain(self.dropped.iter()).collect()
    }

    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Wraps change-set entries into envelopes and appends them.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    config: PublishConfig,
    source: String,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, config: PublishConfig, source: impl Into<String>) -> Self {
        Self {
            broker,
            config,
            source: source.into(),
        }
    }

    pub fn tier(&self) -> Tier {
        self.broker.tier()
    }

    /// Publish every entry of `change_set`, `batch_size` records per envelope.
    pub async fn publish(&self, change_set: &ChangeSet) -> PublishReport {
        let mut report = PublishReport::default();
        let forced = change_set.mode == DetectMode::ForceResync;
        let batch_size = self.config.batch_size.max(1);
        let tier = self.broker.tier();

        for batch in change_set.entries.chunks(batch_size) {
            let records = batch
                .iter()
                .map(|e| e.to_change_record(change_set.detected_at, forced))
                .collect();
            let envelope = Envelope::new(self.source.clone(), records, forced);
            let ids = batch.iter().map(|e| e.entity_id.clone());
            report.envelopes += 1;

            match self.append_with_retry(&envelope, tier).await {
                Ok(message_id) => {
                    tracing::debug!(
                        message_id = %message_id,
                        entries = batch.len(),
                        "envelope handed off",
                    );
                    report.message_ids.push(message_id);
                    report.handed_off.extend(ids);
                }
                Err(err) if tier == Tier::BestEffort => {
                    tracing::warn!(
                        envelope = %envelope.message_id,
                        entries = batch.len(),
                        error = %err,
                        "best-effort publish failed; changes dropped",
                    );
                    report.dropped.extend(ids);
                }
                Err(err) => {
                    tracing::error!(
                        envelope = %envelope.message_id,
                        entries = batch.len(),
                        error = %err,
                        "durable publish failed; entities will be re-detected next cycle",
                    );
                    report.failed.extend(ids);
                }
            }
        }
        report
    }

    async fn append_with_retry(
        &self,
        envelope: &Envelope,
        tier: Tier,
    ) -> Result<MessageId, BrokerError> {
        let attempts = match tier {
            Tier::Durable => self.config.retries.saturating_add(1),
            Tier::BestEffort => 1,
        };
        let mut attempt = 1u32;
        loop {
            let err = match self.append_once(envelope).await {
                Ok(id) => return Ok(id),
                Err(err) => err,
            };
            if attempt >= attempts || !err.is_retryable() {
                return Err(err);
            }
            tracing::warn!(
                envelope = %envelope.message_id,
                attempt,
                error = %err,
                "append failed; retrying",
            );
            tokio::time::sleep(self.config.retry_delay()).await;
            attempt += 1;
        }
    }

    async fn append_once(&self, envelope: &Envelope) -> Result<MessageId, BrokerError> {
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.broker.append(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout {
                operation: "append",
                duration_ms: timeout.as_millis() as u64,
            }),
        }
    }
}
