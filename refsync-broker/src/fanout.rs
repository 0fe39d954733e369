//! Best-effort fan-out: nothing is stored.
//!
//! Each group receives a published envelope on exactly one of its connected
//! members, chosen by hashing the partition key so one entity keeps landing
//! on the same member. Groups with no connected member never see it.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use refsync_core::MessageId;
use uuid::Uuid;

use crate::broker::{Delivery, DeliverySource};

struct Member {
    consumer: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
pub(crate) struct Fanout {
    groups: Mutex<HashMap<String, Vec<Member>>>,
}

impl Fanout {
    pub(crate) fn subscribe(&self, group: &str, consumer: &str) -> FanoutSource {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut groups = self.groups.lock().unwrap_or_else(|p| p.into_inner());
        groups.entry(group.to_string()).or_default().push(Member {
            consumer: consumer.to_string(),
            tx,
        });
        FanoutSource { rx }
    }

    /// Forward to one live member per group. Returns how many groups received it.
    pub(crate) fn publish(&self, partition_key: &str, body: Vec<u8>) -> (MessageId, usize) {
        let message_id = MessageId(Uuid::now_v7().to_string());
        let body = Arc::new(body);
        let mut delivered = 0;

        let mut groups = self.groups.lock().unwrap_or_else(|p| p.into_inner());
        for (group, members) in groups.iter_mut() {
            members.retain(|m| !m.tx.is_closed());
            if members.is_empty() {
                continue;
            }
            let idx = (hash_key(partition_key) % members.len() as u64) as usize;
            let member = &members[idx];
            let sent = member.tx.send(Delivery {
                message_id: message_id.clone(),
                body: body.clone(),
                delivery_count: 1,
            });
            match sent {
                Ok(()) => {
                    tracing::trace!(
                        group = %group,
                        consumer = %member.consumer,
                        "fan-out delivered",
                    );
                    delivered += 1;
                }
                Err(_) => {
                    tracing::debug!(
                        group = %group,
                        consumer = %member.consumer,
                        "member disconnected during fan-out",
                    );
                }
            }
        }
        (message_id, delivered)
    }

    pub(crate) fn connected(&self, group: &str) -> usize {
        let groups = self.groups.lock().unwrap_or_else(|p| p.into_inner());
        groups
            .get(group)
            .map(|members| members.iter().filter(|m| !m.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

pub(crate) struct FanoutSource {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl DeliverySource for FanoutSource {
    async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}
