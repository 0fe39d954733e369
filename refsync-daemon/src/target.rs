//! Downstream targets and the projections that shape records for them.
//!
//! A [`Target`] only knows resource keys and attribute documents. Each
//! consumer pairs one with a [`Projection`] that maps an [`EntityRecord`] to
//! what that target stores.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use refsync_core::{EntityId, EntityRecord, Person};

use crate::error::TargetError;

/// A downstream system.
#[async_trait]
pub trait Target: Send + Sync {
    /// Create or replace the resource at `key`.
    async fn upsert(&self, key: &str, attributes: Value) -> Result<(), TargetError>;

    /// Delete the resource at `key`. Deleting a missing resource succeeds.
    async fn delete(&self, key: &str) -> Result<(), TargetError>;
}

/// Shapes records for one kind of target.
pub trait Projection: Send + Sync {
    fn name(&self) -> &'static str;

    fn resource_key(&self, entity_id: &EntityId) -> String;

    fn attributes(&self, record: &EntityRecord) -> Value;
}

fn people(list: &[Person]) -> Vec<Value> {
    let mut sorted: Vec<&Person> = list.iter().collect();
    sorted.sort();
    sorted
        .into_iter()
        .map(|p| {
            json!({
                "name": p.name,
                "role": p.role,
                "email": p.email,
                "phone": p.phone,
            })
        })
        .collect()
}

/// Calendar events: teams, venue, times, status and officials.
#[derive(Debug, Default, Clone, Copy)]
pub struct CalendarProjection;

impl Projection for CalendarProjection {
    fn name(&self) -> &'static str {
        "calendar"
    }

    fn resource_key(&self, entity_id: &EntityId) -> String {
        format!("event/{entity_id}")
    }

    fn attributes(&self, record: &EntityRecord) -> Value {
        let location = match &record.venue.address {
            Some(address) => format!("{}, {}", record.venue.name, address),
            None => record.venue.name.clone(),
        };
        json!({
            "title": format!("{} vs {}", record.home_team, record.away_team),
            "location": location,
            "start": record.starts_at,
            "end": record.ends_at,
            "status": record.status,
            "competition": record.competition,
            "description": record.notes,
            "attendees": people(&record.assignees),
        })
    }
}

/// Contact lists: the officials and contacts of a match.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContactsProjection;

impl Projection for ContactsProjection {
    fn name(&self) -> &'static str {
        "contacts"
    }

    fn resource_key(&self, entity_id: &EntityId) -> String {
        format!("contact-group/{entity_id}")
    }

    fn attributes(&self, record: &EntityRecord) -> Value {
        json!({
            "group": format!("{} vs {}", record.home_team, record.away_team),
            "officials": people(&record.assignees),
            "contacts": people(&record.contacts),
        })
    }
}

/// One operation observed by a [`MemoryTarget`].
#[derive(Debug, Clone, PartialEq)]
pub enum TargetOp {
    Upsert { key: String, attributes: Value },
    Delete { key: String },
}

/// In-process target keeping resources in a map and every operation in order.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    inner: Mutex<MemoryTargetState>,
}

#[derive(Debug, Default)]
struct MemoryTargetState {
    resources: BTreeMap<String, Value>,
    ops: Vec<TargetOp>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().resources.get(key).cloned()
    }

    pub fn resources(&self) -> BTreeMap<String, Value> {
        self.lock().resources.clone()
    }

    pub fn ops(&self) -> Vec<TargetOp> {
        self.lock().ops.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryTargetState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl Target for MemoryTarget {
    async fn upsert(&self, key: &str, attributes: Value) -> Result<(), TargetError> {
        let mut state = self.lock();
        state.resources.insert(key.to_string(), attributes.clone());
        state.ops.push(TargetOp::Upsert {
            key: key.to_string(),
            attributes,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TargetError> {
        let mut state = self.lock();
        state.resources.remove(key);
        state.ops.push(TargetOp::Delete {
            key: key.to_string(),
        });
        Ok(())
    }
}
