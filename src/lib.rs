//! Broker Relay Library
//!
//! A resilient relay between filesystem directories and message brokers.
//! Broker messages are written to an output directory as files; files
//! dropped in a source directory are published and moved to a completion
//! directory. Connections survive broker restarts and network partitions
//! through bounded retries and signal-driven reconnects.
//!
//! Supports RabbitMQ (`amqp` feature, lapin) and Kafka (`kafka` feature,
//! rdkafka), plus an in-process broker for tests and dry runs.

pub mod api;
pub mod broker;
pub mod connection;
pub mod error;
pub mod messaging;
pub mod relay;
pub mod retry;
pub mod subscriptions;
pub mod types;

pub use connection::{ChannelHandle, ConnectionManager};
pub use error::{BrokerError, RelayError, Result};
pub use messaging::{Consumer, DeliveryHandler, EventHub, PublishCallbacks, Publisher};
pub use relay::Supervisor;
pub use subscriptions::SubscriptionRegistry;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::broker::{BrokerBackend, BrokerChannel, BrokerConnection, ConnectionSignal};
    pub use crate::connection::*;
    pub use crate::error::*;
    pub use crate::messaging::*;
    pub use crate::types::*;
}

/// Default number of connection retries
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default wait between connection attempts, in seconds
pub const DEFAULT_WAIT_AND_RETRY_SECONDS: u64 = 60;

/// Default extension of materialized messages
pub const DEFAULT_FILE_EXTENSION: &str = ".xml";

/// Default publisher scan interval in milliseconds
pub const DEFAULT_PROCESSING_INTERVAL_MS: u64 = 5000;
