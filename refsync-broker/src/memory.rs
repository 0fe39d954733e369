//! In-process broker implementing both tiers behind one [`Broker`] interface.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use refsync_core::config::BrokerConfig;
use refsync_core::{MessageId, Tier};

use crate::broker::{Broker, Delivery, DeliverySource, GroupLag, Subscription};
use crate::error::BrokerError;
use crate::fanout::Fanout;
use crate::log::DurableLog;

struct LogShared {
    log: Mutex<DurableLog>,
    appended: Notify,
}

impl LogShared {
    fn lock(&self) -> MutexGuard<'_, DurableLog> {
        self.log.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Broker whose tier is fixed at construction from configuration.
#[derive(Clone)]
pub struct MemoryBroker {
    tier: Tier,
    log: Arc<LogShared>,
    fanout: Arc<Fanout>,
}

impl MemoryBroker {
    pub fn new(tier: Tier, config: &BrokerConfig) -> Self {
        Self {
            tier,
            log: Arc::new(LogShared {
                log: Mutex::new(
                    DurableLog::new(config.max_len, config.max_age())
                        .with_group_expiry(config.group_expiry()),
                ),
                appended: Notify::new(),
            }),
            fanout: Arc::new(Fanout::default()),
        }
    }

    pub fn durable(config: &BrokerConfig) -> Self {
        Self::new(Tier::Durable, config)
    }

    pub fn best_effort() -> Self {
        Self::new(Tier::BestEffort, &BrokerConfig::default())
    }

    /// Register a consumer group ahead of its first subscriber, so that
    /// everything appended from now on is retained for it.
    pub fn register_group(&self, group: &str) {
        if self.tier == Tier::Durable {
            self.log.lock().ensure_group(group, Instant::now());
        }
    }

    /// Entries currently held by the durable log.
    pub fn retained(&self) -> usize {
        self.log.lock().len()
    }

    /// Connected best-effort members of `group`.
    pub fn connected(&self, group: &str) -> usize {
        self.fanout.connected(group)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn append_bytes(
        &self,
        partition_key: &str,
        body: Vec<u8>,
    ) -> Result<MessageId, BrokerError> {
        match self.tier {
            Tier::BestEffort => {
                let (id, groups) = self.fanout.publish(partition_key, body);
                if groups == 0 {
                    tracing::warn!(
                        message_id = %id,
                        key = partition_key,
                        "no connected subscribers; best-effort message not delivered",
                    );
                }
                Ok(id)
            }
            Tier::Durable => {
                let id = self.log.lock().append(body, Instant::now());
                self.log.appended.notify_waiters();
                Ok(id)
            }
        }
    }

    async fn subscribe(&self, group: &str, consumer: &str) -> Result<Subscription, BrokerError> {
        let source: Box<dyn DeliverySource> = match self.tier {
            Tier::BestEffort => Box::new(self.fanout.subscribe(group, consumer)),
            Tier::Durable => {
                self.log.lock().ensure_group(group, Instant::now());
                Box::new(LogSource {
                    shared: self.log.clone(),
                    group: group.to_string(),
                    consumer: consumer.to_string(),
                })
            }
        };
        tracing::debug!(group, consumer, tier = ?self.tier, "subscribed");
        Ok(Subscription::new(group, consumer, source))
    }

    async fn ack(&self, group: &str, message_id: &MessageId) -> Result<(), BrokerError> {
        if self.tier == Tier::Durable {
            self.log.lock().ack(group, message_id, Instant::now());
        }
        Ok(())
    }

    async fn pending(
        &self,
        group: &str,
        older_than: Duration,
    ) -> Result<Vec<MessageId>, BrokerError> {
        match self.tier {
            Tier::BestEffort => Ok(Vec::new()),
            Tier::Durable => Ok(self.log.lock().pending(group, older_than, Instant::now())),
        }
    }

    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<Delivery>, BrokerError> {
        match self.tier {
            Tier::BestEffort => Ok(Vec::new()),
            Tier::Durable => Ok(self
                .log
                .lock()
                .claim(group, consumer, min_idle, ids, Instant::now())),
        }
    }

    async fn touch(
        &self,
        group: &str,
        consumer: &str,
        ids: &[MessageId],
    ) -> Result<(), BrokerError> {
        if self.tier == Tier::Durable && !ids.is_empty() {
            let refreshed = self.log.lock().touch(group, consumer, ids, Instant::now());
            tracing::trace!(group, consumer, refreshed, "pending messages touched");
        }
        Ok(())
    }

    async fn lag(&self, group: &str) -> Result<GroupLag, BrokerError> {
        match self.tier {
            Tier::BestEffort => Ok(GroupLag::default()),
            Tier::Durable => Ok(self.log.lock().lag(group)),
        }
    }
}

struct LogSource {
    shared: Arc<LogShared>,
    group: String,
    consumer: String,
}

#[async_trait]
impl DeliverySource for LogSource {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            // Register interest before checking, so an append between the
            // check and the await is not missed.
            let appended = self.shared.appended.notified();
            let next = {
                let mut log = self.shared.lock();
                log.read(&self.group, &self.consumer, 1, Instant::now()).pop()
            };
            if next.is_some() {
                return next;
            }
            appended.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn durable() -> MemoryBroker {
        MemoryBroker::durable(&BrokerConfig::default())
    }

    #[tokio::test]
    async fn durable_subscription_wakes_on_append() {
        let broker = durable();
        let mut sub = broker.subscribe("calendar", "c1").await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            publisher.append_bytes("M1", b"hello".to_vec()).await.unwrap();
        });

        let delivery = tokio::time::timeout(StdDuration::from_secs(2), sub.next())
            .await
            .expect("delivery before timeout")
            .expect("open subscription");
        assert_eq!(delivery.body.as_slice(), b"hello");
        assert_eq!(delivery.delivery_count, 1);
    }

    #[tokio::test]
    async fn best_effort_reports_no_pending_and_no_lag() {
        let broker = MemoryBroker::best_effort();
        let _sub = broker.subscribe("calendar", "c1").await.unwrap();
        broker.append_bytes("M1", b"x".to_vec()).await.unwrap();
        assert!(broker
            .pending("calendar", StdDuration::ZERO)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(broker.lag("calendar").await.unwrap(), GroupLag::default());
        assert_eq!(broker.retained(), 0);
    }

    #[tokio::test]
    async fn best_effort_routes_one_member_per_group() {
        let broker = MemoryBroker::best_effort();
        let mut a = broker.subscribe("calendar", "a").await.unwrap();
        let mut b = broker.subscribe("calendar", "b").await.unwrap();
        let mut k = broker.subscribe("contacts", "k").await.unwrap();
        broker.append_bytes("M1", b"x".to_vec()).await.unwrap();

        assert!(tokio::time::timeout(StdDuration::from_secs(1), k.next())
            .await
            .unwrap()
            .is_some());

        let got_a = tokio::time::timeout(StdDuration::from_millis(50), a.next())
            .await
            .ok()
            .flatten()
            .is_some();
        let got_b = tokio::time::timeout(StdDuration::from_millis(50), b.next())
            .await
            .ok()
            .flatten()
            .is_some();
        assert!(got_a ^ got_b, "exactly one calendar member receives it");
    }
}
