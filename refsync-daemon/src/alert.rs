//! Operator alerts.

use std::fmt;

use refsync_core::{ConsumerId, EntityId, MessageId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// A message was parked because this consumer cannot decode it.
    MessageParked {
        consumer: ConsumerId,
        message_id: MessageId,
        reason: String,
    },
    /// A change was moved to the dead-letter queue.
    DeadLettered {
        consumer: ConsumerId,
        entity_id: EntityId,
        error: String,
    },
    /// The dead-letter queue or parked list is full; the message stays
    /// unacknowledged until it is drained.
    QueueFull {
        consumer: ConsumerId,
        message_id: MessageId,
        list: &'static str,
    },
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::MessageParked {
                consumer,
                message_id,
                reason,
            } => write!(f, "[{consumer}] message {message_id} parked: {reason}"),
            Alert::DeadLettered {
                consumer,
                entity_id,
                error,
            } => write!(f, "[{consumer}] {entity_id} dead-lettered: {error}"),
            Alert::QueueFull {
                consumer,
                message_id,
                list,
            } => write!(f, "[{consumer}] {list} full; message {message_id} held back"),
        }
    }
}

/// Where alerts go. Implementations must not block.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

/// Alerts as `error`-level log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise(&self, alert: Alert) {
        tracing::error!(alert = %alert, "operator alert");
    }
}
