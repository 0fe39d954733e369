//! refsync core library: domain types, record schema, envelope, config, errors.
//!
//! Public API surface:
//! - [`types`]: identifier newtypes and change classification
//! - [`record`]: the validated upstream [`EntityRecord`] schema
//! - [`envelope`]: versioned wire envelope
//! - [`config`]: YAML configuration
//! - [`error`]: [`RecordError`], [`EnvelopeError`], [`ConfigError`]

pub mod config;
pub mod envelope;
pub mod error;
pub mod record;
pub mod types;

pub use config::{Config, Tier};
pub use envelope::{Envelope, Payload, PayloadMetadata, SchemaVersion, SupportedVersions};
pub use error::{ConfigError, EnvelopeError, RecordError};
pub use record::{EntityRecord, MatchStatus, Person, Venue};
pub use types::{ChangeRecord, ChangeType, ConsumerId, EntityId, Fingerprint, MessageId};
