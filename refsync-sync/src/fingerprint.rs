//! Content fingerprints.
//!
//! A fingerprint is the SHA-256 of a canonical JSON projection of the
//! change-relevant fields of an [`EntityRecord`]. The projection is one shared
//! superset of what every consumer reads: a field missing here is a field whose
//! changes no consumer will ever see. `source_updated_at` is the only record
//! field left out.
//!
//! Assignee and contact lists are sorted first, so upstream reordering alone is
//! not a change.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use refsync_core::{EntityRecord, Fingerprint, MatchStatus, Person, RecordError};

/// Domain prefix hashed ahead of the projection. Bump when the projection changes.
const FINGERPRINT_DOMAIN: &[u8] = b"refsync.match.v1\n";

#[derive(Serialize)]
struct Projection<'a> {
    id: &'a str,
    home_team: &'a str,
    away_team: &'a str,
    venue_name: &'a str,
    venue_address: Option<&'a str>,
    starts_at: DateTime<Utc>,
    ends_at: Option<DateTime<Utc>>,
    competition: Option<&'a str>,
    status: MatchStatus,
    notes: Option<&'a str>,
    assignees: Vec<&'a Person>,
    contacts: Vec<&'a Person>,
}

fn sorted(people: &[Person]) -> Vec<&Person> {
    let mut out: Vec<&Person> = people.iter().collect();
    out.sort();
    out
}

/// Fingerprint a validated record.
pub fn compute(record: &EntityRecord) -> Fingerprint {
    let projection = Projection {
        id: &record.id.0,
        home_team: &record.home_team,
        away_team: &record.away_team,
        venue_name: &record.venue.name,
        venue_address: record.venue.address.as_deref(),
        starts_at: record.starts_at,
        ends_at: record.ends_at,
        competition: record.competition.as_deref(),
        status: record.status,
        notes: record.notes.as_deref(),
        assignees: sorted(&record.assignees),
        contacts: sorted(&record.contacts),
    };

    let mut h = Sha256::new();
    h.update(FINGERPRINT_DOMAIN);
    // Serializing a struct of strings, timestamps and a unit enum into a Vec
    // cannot fail; an empty body would still hash deterministically.
    h.update(serde_json::to_vec(&projection).unwrap_or_default());
    Fingerprint(hex::encode(h.finalize()))
}

/// Validate a raw upstream value and fingerprint it.
pub fn compute_raw(value: &Value) -> Result<(EntityRecord, Fingerprint), RecordError> {
    let record = EntityRecord::from_value(value)?;
    let fingerprint = compute(&record);
    Ok((record, fingerprint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Value {
        json!({
            "id": "M1",
            "homeTeam": "Rovers",
            "awayTeam": "United",
            "venue": {"name": "North Field"},
            "startsAt": "2025-09-27T14:00:00Z",
            "assignees": [
                {"name": "A. Ref", "role": "referee"},
                {"name": "B. Line", "role": "assistant"}
            ]
        })
    }

    #[test]
    fn fingerprint_is_64_hex() {
        let (_, fp) = compute_raw(&base()).unwrap();
        assert!(fp.is_well_formed());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let (_, a) = compute_raw(&base()).unwrap();
        let (_, b) = compute_raw(&base()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn assignee_order_does_not_matter() {
        let mut reordered = base();
        reordered["assignees"] = json!([
            {"name": "B. Line", "role": "assistant"},
            {"name": "A. Ref", "role": "referee"}
        ]);
        assert_eq!(compute_raw(&base()).unwrap().1, compute_raw(&reordered).unwrap().1);
    }

    #[test]
    fn source_updated_at_is_not_change_relevant() {
        let mut touched = base();
        touched["sourceUpdatedAt"] = json!("2025-09-26T10:00:00Z");
        assert_eq!(compute_raw(&base()).unwrap().1, compute_raw(&touched).unwrap().1);
    }

    #[test]
    fn equivalent_timestamp_spellings_match() {
        let mut offset = base();
        offset["startsAt"] = json!("2025-09-27T16:00:00+02:00");
        assert_eq!(compute_raw(&base()).unwrap().1, compute_raw(&offset).unwrap().1);
    }
}
