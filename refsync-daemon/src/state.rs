//! Delivery state machine, tracked per change record per consumer.
//!
//! ```text
//! Received → Validated → Duplicate   → Acked
//!                      → Superseded  → Acked
//!                      → Applying → Applied → Acked
//!                                 → ApplyFailed(n) → Retrying(n) → Applying …
//!                                                  → DeadLettered → Acked
//! Retrying(n) → Duplicate | Superseded   (another member got there first)
//! Received → Parked → Acked
//! ```

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    Validated,
    Duplicate,
    Superseded,
    Applying,
    Applied,
    ApplyFailed { attempt: u32 },
    Retrying(u32),
    DeadLettered,
    Parked,
    Acked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid delivery state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: DeliveryState,
    pub to: DeliveryState,
}

impl DeliveryState {
    /// Move to `next`, rejecting anything the machine does not allow.
    pub fn advance(self, next: DeliveryState) -> Result<DeliveryState, InvalidTransition> {
        use DeliveryState::*;
        let allowed = match (self, next) {
            (Received, Validated | Parked) => true,
            (Validated, Duplicate | Superseded | Applying) => true,
            (Applying, Applied) => true,
            (Applying, ApplyFailed { .. }) => true,
            (ApplyFailed { attempt }, Retrying(n)) => n == attempt,
            (ApplyFailed { .. }, DeadLettered) => true,
            (Retrying(_), Applying | Duplicate | Superseded) => true,
            (Duplicate | Superseded | Applied | DeadLettered | Parked, Acked) => true,
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(InvalidTransition { from: self, to: next })
        }
    }

    /// Nothing further will happen to the change; its message may be acked.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            DeliveryState::Duplicate
                | DeliveryState::Superseded
                | DeliveryState::Applied
                | DeliveryState::DeadLettered
                | DeliveryState::Parked
        )
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryState::Received => f.write_str("received"),
            DeliveryState::Validated => f.write_str("validated"),
            DeliveryState::Duplicate => f.write_str("duplicate"),
            DeliveryState::Superseded => f.write_str("superseded"),
            DeliveryState::Applying => f.write_str("applying"),
            DeliveryState::Applied => f.write_str("applied"),
            DeliveryState::ApplyFailed { attempt } => write!(f, "apply_failed({attempt})"),
            DeliveryState::Retrying(n) => write!(f, "retrying({n})"),
            DeliveryState::DeadLettered => f.write_str("dead_lettered"),
            DeliveryState::Parked => f.write_str("parked"),
            DeliveryState::Acked => f.write_str("acked"),
        }
    }
}
