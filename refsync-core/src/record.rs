//! Upstream record schema and ingestion-boundary validation.
//!
//! The upstream source hands over loosely-typed JSON. [`EntityRecord::from_value`]
//! is the only way a record enters the pipeline: required fields are checked,
//! optional fields default, and anything that does not fit is rejected with a
//! [`RecordError`] naming the field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RecordError;
use crate::types::EntityId;

/// Lifecycle status of a scheduled match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    #[default]
    Scheduled,
    Postponed,
    Cancelled,
    Completed,
}

/// Where a match is played.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Venue {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// An assigned official or a contact person.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// A validated upstream scheduling record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub id: EntityId,
    pub home_team: String,
    pub away_team: String,
    pub venue: Venue,
    pub starts_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub competition: Option<String>,
    #[serde(default)]
    pub status: MatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub assignees: Vec<Person>,
    #[serde(default)]
    pub contacts: Vec<Person>,
    /// Upstream bookkeeping timestamp. Not change-relevant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_updated_at: Option<DateTime<Utc>>,
}

const REQUIRED_FIELDS: [&str; 4] = ["homeTeam", "awayTeam", "venue", "startsAt"];

impl EntityRecord {
    /// Validate one raw upstream value into a record.
    pub fn from_value(value: &Value) -> Result<Self, RecordError> {
        let obj = value.as_object().ok_or(RecordError::NotAnObject)?;

        let id = match obj.get("id") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            _ => {
                return Err(RecordError::MissingField {
                    id: String::new(),
                    field: "id",
                })
            }
        };

        for field in REQUIRED_FIELDS {
            match obj.get(field) {
                None | Some(Value::Null) => {
                    return Err(RecordError::MissingField { id, field });
                }
                Some(_) => {}
            }
        }

        let record: EntityRecord =
            serde_json::from_value(value.clone()).map_err(|e| RecordError::InvalidField {
                id: id.clone(),
                field: "record".to_string(),
                reason: e.to_string(),
            })?;

        record.validate()?;
        Ok(EntityRecord {
            id: EntityId(id),
            ..record
        })
    }

    fn validate(&self) -> Result<(), RecordError> {
        let id = self.id.0.trim().to_string();
        let non_empty = |field: &'static str, value: &str| {
            if value.trim().is_empty() {
                Err(RecordError::MissingField {
                    id: id.clone(),
                    field,
                })
            } else {
                Ok(())
            }
        };
        non_empty("homeTeam", &self.home_team)?;
        non_empty("awayTeam", &self.away_team)?;
        non_empty("venue.name", &self.venue.name)?;

        if let Some(ends_at) = self.ends_at {
            if ends_at < self.starts_at {
                return Err(RecordError::InvalidField {
                    id,
                    field: "endsAt".to_string(),
                    reason: "ends before it starts".to_string(),
                });
            }
        }

        for (list, people) in [("assignees", &self.assignees), ("contacts", &self.contacts)] {
            if let Some(pos) = people.iter().position(|p| p.name.trim().is_empty()) {
                return Err(RecordError::InvalidField {
                    id,
                    field: format!("{list}[{pos}].name"),
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw() -> Value {
        json!({
            "id": "M1",
            "homeTeam": "Rovers",
            "awayTeam": "United",
            "venue": {"name": "North Field"},
            "startsAt": "2025-09-27T14:00:00Z"
        })
    }

    #[test]
    fn minimal_record_uses_defaults() {
        let record = EntityRecord::from_value(&raw()).expect("valid");
        assert_eq!(record.id, EntityId::from("M1"));
        assert_eq!(record.status, MatchStatus::Scheduled);
        assert!(record.assignees.is_empty());
        assert!(record.contacts.is_empty());
    }

    #[test]
    fn missing_id_is_reported_without_id() {
        let mut value = raw();
        value.as_object_mut().unwrap().remove("id");
        let err = EntityRecord::from_value(&value).unwrap_err();
        assert_eq!(err.record_id(), None);
        assert!(matches!(err, RecordError::MissingField { field: "id", .. }));
    }

    #[test]
    fn missing_required_field_names_field() {
        let mut value = raw();
        value.as_object_mut().unwrap().remove("startsAt");
        let err = EntityRecord::from_value(&value).unwrap_err();
        assert_eq!(
            err,
            RecordError::MissingField {
                id: "M1".to_string(),
                field: "startsAt"
            }
        );
    }

    #[test]
    fn bad_timestamp_is_invalid_field() {
        let mut value = raw();
        value["startsAt"] = json!("next tuesday");
        let err = EntityRecord::from_value(&value).unwrap_err();
        assert!(matches!(err, RecordError::InvalidField { .. }), "got {err}");
        assert_eq!(err.record_id(), Some("M1"));
    }

    #[test]
    fn end_before_start_is_rejected() {
        let mut value = raw();
        value["endsAt"] = json!("2025-09-27T13:00:00Z");
        assert!(EntityRecord::from_value(&value).is_err());
    }

    #[test]
    fn unnamed_assignee_is_rejected() {
        let mut value = raw();
        value["assignees"] = json!([{"name": "A. Ref"}, {"name": " "}]);
        let err = EntityRecord::from_value(&value).unwrap_err();
        assert!(err.to_string().contains("assignees[1].name"), "got {err}");
    }

    #[test]
    fn non_object_is_rejected() {
        assert_eq!(
            EntityRecord::from_value(&json!([1, 2])).unwrap_err(),
            RecordError::NotAnObject
        );
    }
}
