//! Dead letters and parked messages, held for operator inspection.
//!
//! Both lists are bounded. A full list refuses new entries rather than
//! evicting old ones; the subscriber then leaves the message unacknowledged,
//! so it comes back once an operator has drained the list.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

use refsync_core::{ChangeRecord, ConsumerId, MessageId};

/// A change that exhausted its retries or failed permanently.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub consumer: ConsumerId,
    pub message_id: MessageId,
    pub change: ChangeRecord,
    pub error: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// A message that could not be decoded for this consumer, kept verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct ParkedMessage {
    pub consumer: ConsumerId,
    pub message_id: MessageId,
    pub reason: String,
    pub parked_at: DateTime<Utc>,
    #[serde(skip)]
    pub body: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{list} is full ({capacity} entries)")]
pub struct QueueFull {
    pub list: &'static str,
    pub capacity: usize,
}

pub struct DeadLetterQueue {
    max_size: usize,
    entries: RwLock<VecDeque<DeadLetter>>,
    parked: RwLock<VecDeque<ParkedMessage>>,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            entries: RwLock::new(VecDeque::new()),
            parked: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn push(&self, entry: DeadLetter) -> Result<(), QueueFull> {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_size {
            return Err(QueueFull {
                list: "dead-letter queue",
                capacity: self.max_size,
            });
        }
        entries.push_back(entry);
        Ok(())
    }

    pub async fn park(&self, message: ParkedMessage) -> Result<(), QueueFull> {
        let mut parked = self.parked.write().await;
        if parked.len() >= self.max_size {
            return Err(QueueFull {
                list: "parked list",
                capacity: self.max_size,
            });
        }
        parked.push_back(message);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Dead letters held for `consumer`.
    pub async fn count_for(&self, consumer: &ConsumerId) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .filter(|d| &d.consumer == consumer)
            .count()
    }

    pub async fn parked_len(&self) -> usize {
        self.parked.read().await.len()
    }

    pub async fn peek(&self, count: usize) -> Vec<DeadLetter> {
        self.entries.read().await.iter().take(count).cloned().collect()
    }

    pub async fn drain(&self) -> Vec<DeadLetter> {
        self.entries.write().await.drain(..).collect()
    }

    pub async fn peek_parked(&self, count: usize) -> Vec<ParkedMessage> {
        self.parked.read().await.iter().take(count).cloned().collect()
    }

    pub async fn drain_parked(&self) -> Vec<ParkedMessage> {
        self.parked.write().await.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refsync_core::{ChangeType, EntityId};

    fn letter(id: &str) -> DeadLetter {
        DeadLetter {
            consumer: ConsumerId::from("calendar"),
            message_id: MessageId::from("1-0"),
            change: ChangeRecord {
                entity_id: EntityId::from(id),
                change_type: ChangeType::Removed,
                old_fingerprint: None,
                new_fingerprint: None,
                detected_at: None,
                forced: false,
                record: None,
            },
            error: "boom".to_string(),
            attempts: 3,
            dead_lettered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn full_queue_refuses_without_evicting() {
        let dlq = DeadLetterQueue::new(2);
        dlq.push(letter("M1")).await.unwrap();
        dlq.push(letter("M2")).await.unwrap();
        let err = dlq.push(letter("M3")).await.unwrap_err();
        assert_eq!(
            err,
            QueueFull {
                list: "dead-letter queue",
                capacity: 2
            }
        );
        let ids: Vec<_> = dlq
            .peek(10)
            .await
            .into_iter()
            .map(|d| d.change.entity_id.0)
            .collect();
        assert_eq!(ids, vec!["M1", "M2"]);

        dlq.drain().await;
        assert!(dlq.push(letter("M3")).await.is_ok());
    }

    #[tokio::test]
    async fn full_parked_list_refuses_new_messages() {
        let dlq = DeadLetterQueue::new(1);
        let parked = |id: &str| ParkedMessage {
            consumer: ConsumerId::from("calendar"),
            message_id: MessageId::from(id),
            reason: "unsupported schema version 9.9".to_string(),
            parked_at: Utc::now(),
            body: Arc::new(Vec::new()),
        };
        dlq.park(parked("1-0")).await.unwrap();
        assert!(dlq.park(parked("2-0")).await.is_err());
        assert_eq!(dlq.peek_parked(10).await[0].message_id, MessageId::from("1-0"));
    }

    #[tokio::test]
    async fn drain_empties_queue() {
        let dlq = DeadLetterQueue::new(10);
        dlq.push(letter("M1")).await.unwrap();
        assert_eq!(dlq.drain().await.len(), 1);
        assert!(dlq.is_empty().await);
    }
}
