//! # refsync-sync
//!
//! Fingerprint-gated change detection and publication.
//!
//! Call [`CycleRunner::run`] to fetch a snapshot, classify every entity against
//! the [`FingerprintStore`], publish the resulting change-set through a
//! [`refsync_broker::Broker`], and commit fingerprints only for entities whose
//! change was handed off.

pub mod cycle;
pub mod detector;
pub mod error;
pub mod fingerprint;
pub mod fingerprint_store;
pub mod publisher;

pub use cycle::{CycleOutcome, CycleReport, CycleRunner, SnapshotSource};
pub use detector::{detect, ChangeSet, ChangeSetEntry, DetectMode, SkippedRecord};
pub use error::{SourceError, SyncError};
pub use fingerprint_store::{
    FileFingerprintStore, FingerprintStore, FingerprintUpdate, MemoryFingerprintStore,
};
pub use publisher::{PublishReport, Publisher};
