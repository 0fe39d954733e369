//! refsync daemon: subscribers, processing records and the runtime that
//! schedules detection cycles.

pub mod alert;
pub mod dlq;
mod error;
pub mod paths;
pub mod processing;
pub mod retry;
mod runtime;
pub mod state;
pub mod subscriber;
pub mod target;

pub use alert::{Alert, AlertSink, LogAlertSink};
pub use dlq::{DeadLetter, DeadLetterQueue, ParkedMessage, QueueFull};
pub use error::{DaemonError, TargetError};
pub use processing::{
    FileProcessingStore, MemoryProcessingStore, ProcessingRecord, ProcessingStore,
};
pub use retry::RetryPolicy;
pub use runtime::{init_tracing, start_blocking, ConsumerSpec, Daemon, DaemonHandle};
pub use state::{DeliveryState, InvalidTransition};
pub use subscriber::{ConsumerContext, Subscriber};
pub use target::{
    CalendarProjection, ContactsProjection, MemoryTarget, Projection, Target, TargetOp,
};
