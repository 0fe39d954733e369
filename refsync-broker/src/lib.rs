//! # refsync-broker
//!
//! Technology-independent broker contract plus an in-process adapter that
//! implements both delivery tiers behind the same [`Broker`] interface.
//!
//! - [`Tier::BestEffort`] fans envelopes out to connected subscribers only.
//! - [`Tier::Durable`] appends to a bounded, replayable [`log::DurableLog`] with
//!   consumer groups, acknowledgements and claim-based redelivery.

pub mod broker;
pub mod error;
mod fanout;
pub mod log;
pub mod memory;

pub use broker::{Broker, Delivery, DeliverySource, GroupLag, Subscription};
pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use refsync_core::Tier;
