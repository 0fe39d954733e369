//! The broker contract.
//!
//! Callers never branch on the backing technology: the tier is a capability
//! reported by [`Broker::tier`] and chosen by configuration when the broker is
//! constructed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use refsync_core::{Envelope, MessageId, Tier};

use crate::error::BrokerError;

/// One message handed to a subscriber.
#[derive(Clone)]
pub struct Delivery {
    pub message_id: MessageId,
    /// Raw envelope bytes; the subscriber decodes and version-checks them.
    pub body: Arc<Vec<u8>>,
    /// 1 on first delivery, incremented on every claim.
    pub delivery_count: u32,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("bytes", &self.body.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// Backing stream of a [`Subscription`].
#[async_trait]
pub trait DeliverySource: Send {
    /// Wait for the next delivery. `None` means the subscription is closed.
    async fn next(&mut self) -> Option<Delivery>;
}

/// A consumer-group member's view of the broker.
pub struct Subscription {
    group: String,
    consumer: String,
    source: Box<dyn DeliverySource>,
}

impl Subscription {
    pub fn new(
        group: impl Into<String>,
        consumer: impl Into<String>,
        source: Box<dyn DeliverySource>,
    ) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            source,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.source.next().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish()
    }
}

/// Per-group backlog, for operator views.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupLag {
    /// Retained entries the group has not read yet.
    pub unread: usize,
    /// Entries read but not acknowledged.
    pub pending: usize,
}

/// Store-and-forward contract shared by both delivery tiers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Durability capability of this broker.
    fn tier(&self) -> Tier;

    /// Store or forward one encoded envelope. `partition_key` routes the
    /// message to a single member of each group on the best-effort tier.
    async fn append_bytes(
        &self,
        partition_key: &str,
        body: Vec<u8>,
    ) -> Result<MessageId, BrokerError>;

    /// Store or forward one envelope.
    async fn append(&self, envelope: &Envelope) -> Result<MessageId, BrokerError> {
        let body = envelope.to_bytes()?;
        self.append_bytes(envelope.partition_key(), body).await
    }

    /// Join `group` as `consumer` and start receiving deliveries.
    async fn subscribe(&self, group: &str, consumer: &str) -> Result<Subscription, BrokerError>;

    /// Acknowledge a message for `group`. Acknowledging twice is a no-op.
    async fn ack(&self, group: &str, message_id: &MessageId) -> Result<(), BrokerError>;

    /// Unacknowledged messages of `group` idle for at least `older_than`.
    async fn pending(
        &self,
        group: &str,
        older_than: Duration,
    ) -> Result<Vec<MessageId>, BrokerError>;

    /// Take over pending messages idle for at least `min_idle`, returning them
    /// for redelivery to `consumer`.
    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<Delivery>, BrokerError>;

    /// Reset the idle time of pending messages `consumer` is still working
    /// on, so no other member claims them. Tiers without claims ignore it.
    async fn touch(
        &self,
        _group: &str,
        _consumer: &str,
        _ids: &[MessageId],
    ) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Backlog of `group`.
    async fn lag(&self, group: &str) -> Result<GroupLag, BrokerError>;
}
