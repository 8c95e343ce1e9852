//! Lightweight AMQP-style message broker core.
//!
//! Exchanges route published messages into queues through bindings; each
//! queue keeps its live messages in memory and, when durable, in an
//! append-only log that supports in-place invalidation and compaction.
//! Consumers subscribed on channels receive messages round-robin from a
//! fixed worker pool. Transport and wire encoding are left to the caller,
//! which drives everything through [`Broker::handle`].

pub mod broker;
pub mod channel;
pub mod clock;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod message;
pub mod meta;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod store;
pub mod vhost;

pub use broker::Broker;
pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use config::BrokerConfig;
pub use error::{Error, Result};
pub use message::{BasicProperties, DeliveryMode, Message};
pub use protocol::{Request, Response, ResponseSink};
pub use registry::{Binding, DeadLetterConfig, Exchange, QueueMeta};
pub use router::ExchangeType;
pub use vhost::{NackOutcome, PublishOutcome, QueueStatus, VirtualHost};
