//! Bounded, replayable log with consumer groups.
//!
//! Entries carry a monotonically increasing sequence number; message ids are
//! rendered as `<seq>-0`. Each group keeps a read cursor (last sequence handed
//! out) and a pending list of entries read but not yet acknowledged.
//!
//! Retention trims from the front by length and age, but only entries that
//! every active group has both read and acknowledged. An entry that some
//! active group still needs is never discarded, so trimming stops at the first
//! such entry and the log stays contiguous.
//!
//! A group with no reads, acks, claims or heartbeats for the group expiry
//! stops pinning entries. Trimming past it advances its cursor and drops its
//! pending entries, with a warning naming how many it lost.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use refsync_core::MessageId;

use crate::broker::{Delivery, GroupLag};

#[derive(Debug)]
struct LogEntry {
    seq: u64,
    body: Arc<Vec<u8>>,
    appended_at: Instant,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug)]
struct GroupState {
    cursor: u64,
    pending: BTreeMap<u64, PendingEntry>,
    last_active: Instant,
}

/// The durable tier's storage.
#[derive(Debug)]
pub struct DurableLog {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
    groups: BTreeMap<String, GroupState>,
    max_len: usize,
    max_age: Duration,
    group_expiry: Duration,
}

/// Render a sequence number as a message id.
pub fn message_id(seq: u64) -> MessageId {
    MessageId(format!("{seq}-0"))
}

/// Parse a message id produced by [`message_id`].
pub fn parse_seq(id: &MessageId) -> Option<u64> {
    id.0.split_once('-')
        .map(|(seq, _)| seq)
        .unwrap_or(&id.0)
        .parse()
        .ok()
}

impl DurableLog {
    /// Groups expire after twice `max_age` unless set otherwise.
    pub fn new(max_len: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 1,
            groups: BTreeMap::new(),
            max_len,
            max_age,
            group_expiry: max_age.saturating_mul(2),
        }
    }

    pub fn with_group_expiry(mut self, group_expiry: Duration) -> Self {
        self.group_expiry = group_expiry;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register `group` if new, or mark it active. A new group starts at the
    /// oldest retained entry.
    pub fn ensure_group(&mut self, group: &str, now: Instant) {
        if let Some(state) = self.groups.get_mut(group) {
            state.last_active = now;
            return;
        }
        let cursor = self
            .entries
            .front()
            .map(|e| e.seq.saturating_sub(1))
            .unwrap_or(self.next_seq - 1);
        self.groups.insert(
            group.to_string(),
            GroupState {
                cursor,
                pending: BTreeMap::new(),
                last_active: now,
            },
        );
    }

    pub fn append(&mut self, body: Vec<u8>, now: Instant) -> MessageId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(LogEntry {
            seq,
            body: Arc::new(body),
            appended_at: now,
        });
        self.trim(now);
        message_id(seq)
    }

    /// Hand up to `count` unread entries to `consumer`, marking them pending.
    pub fn read(
        &mut self,
        group: &str,
        consumer: &str,
        count: usize,
        now: Instant,
    ) -> Vec<Delivery> {
        self.ensure_group(group, now);
        let Some(state) = self.groups.get_mut(group) else {
            return Vec::new();
        };
        let start = state.cursor;
        let mut out = Vec::new();
        for entry in self.entries.iter().filter(|e| e.seq > start) {
            if out.len() >= count {
                break;
            }
            state.cursor = entry.seq;
            state.pending.insert(
                entry.seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            out.push(Delivery {
                message_id: message_id(entry.seq),
                body: entry.body.clone(),
                delivery_count: 1,
            });
        }
        out
    }

    /// Remove `id` from the group's pending list. Returns whether it was pending.
    pub fn ack(&mut self, group: &str, id: &MessageId, now: Instant) -> bool {
        let Some(seq) = parse_seq(id) else {
            return false;
        };
        let removed = self
            .groups
            .get_mut(group)
            .map(|state| {
                state.last_active = now;
                state.pending.remove(&seq).is_some()
            })
            .unwrap_or(false);
        if removed {
            self.trim(now);
        }
        removed
    }

    /// Pending ids idle for at least `older_than`, oldest first.
    pub fn pending(&self, group: &str, older_than: Duration, now: Instant) -> Vec<MessageId> {
        self.groups
            .get(group)
            .map(|state| {
                state
                    .pending
                    .iter()
                    .filter(|(_, p)| now.saturating_duration_since(p.delivered_at) >= older_than)
                    .map(|(seq, _)| message_id(*seq))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reassign idle pending entries to `consumer` and return them.
    pub fn claim(
        &mut self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
        now: Instant,
    ) -> Vec<Delivery> {
        let Some(state) = self.groups.get_mut(group) else {
            return Vec::new();
        };
        state.last_active = now;
        let mut seqs: Vec<u64> = ids.iter().filter_map(parse_seq).collect();
        seqs.sort_unstable();
        seqs.dedup();

        let mut out = Vec::new();
        for seq in seqs {
            let Some(pending) = state.pending.get_mut(&seq) else {
                continue;
            };
            if now.saturating_duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            let Some(entry) = self.entries.iter().find(|e| e.seq == seq) else {
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            out.push(Delivery {
                message_id: message_id(seq),
                body: entry.body.clone(),
                delivery_count: pending.delivery_count,
            });
        }
        out
    }

    /// Reset the idle time of the pending entries in `ids` that `consumer`
    /// still holds. Returns how many were refreshed.
    pub fn touch(&mut self, group: &str, consumer: &str, ids: &[MessageId], now: Instant) -> usize {
        let Some(state) = self.groups.get_mut(group) else {
            return 0;
        };
        state.last_active = now;
        let mut refreshed = 0;
        for seq in ids.iter().filter_map(parse_seq) {
            if let Some(pending) = state.pending.get_mut(&seq) {
                if pending.consumer == consumer {
                    pending.delivered_at = now;
                    refreshed += 1;
                }
            }
        }
        refreshed
    }

    /// Consumer currently holding a pending entry.
    pub fn pending_owner(&self, group: &str, id: &MessageId) -> Option<&str> {
        let seq = parse_seq(id)?;
        self.groups
            .get(group)?
            .pending
            .get(&seq)
            .map(|p| p.consumer.as_str())
    }

    pub fn lag(&self, group: &str) -> GroupLag {
        match self.groups.get(group) {
            Some(state) => GroupLag {
                unread: self.entries.iter().filter(|e| e.seq > state.cursor).count(),
                pending: state.pending.len(),
            },
            None => GroupLag {
                unread: self.entries.len(),
                pending: 0,
            },
        }
    }

    /// Drop front entries over the length or age bound that no active group
    /// still needs.
    pub fn trim(&mut self, now: Instant) -> usize {
        let expiry = self.group_expiry;
        let mut dropped = 0;
        while let Some(front) = self.entries.front() {
            let over_len = self.entries.len() > self.max_len;
            let over_age = now.saturating_duration_since(front.appended_at) > self.max_age;
            if !(over_len || over_age) {
                break;
            }
            let seq = front.seq;
            let still_needed = self.groups.values().any(|g| {
                now.saturating_duration_since(g.last_active) <= expiry
                    && (g.cursor < seq || g.pending.contains_key(&seq))
            });
            if still_needed {
                break;
            }
            self.entries.pop_front();
            dropped += 1;
        }
        if dropped == 0 {
            return 0;
        }
        tracing::debug!(dropped, retained = self.entries.len(), "trimmed durable log");

        // Expired groups lose whatever was trimmed ahead of them.
        let floor = self
            .entries
            .front()
            .map(|e| e.seq)
            .unwrap_or(self.next_seq);
        for (name, state) in self.groups.iter_mut() {
            let unread = floor.saturating_sub(1).saturating_sub(state.cursor);
            let before = state.pending.len();
            state.pending.retain(|seq, _| *seq >= floor);
            let lost = unread as usize + (before - state.pending.len());
            if lost > 0 {
                state.cursor = state.cursor.max(floor - 1);
                tracing::warn!(
                    group = %name,
                    lost,
                    idle_secs = now.saturating_duration_since(state.last_active).as_secs(),
                    "trimmed entries an expired group never acknowledged",
                );
            }
        }
        dropped
    }
}
