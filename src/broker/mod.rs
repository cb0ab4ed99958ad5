//! Broker backends.
//!
//! A backend turns a [`ConnectionDescriptor`] into a live connection. Every
//! backend exposes the same capability set (connect, open channel, publish,
//! consume, acknowledge) so the connection manager, consumer and publisher
//! never depend on a particular client library.
//!
//! - `amqp`: RabbitMQ through lapin
//! - `kafka`: Kafka through rdkafka
//! - `memory`: an in-process broker used by tests and dry runs

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod factory;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::types::{BackendKind, InboundDelivery, OutboundMessage, PublishOutcome, RouteDescriptor};

pub use factory::{build_descriptor, AmqpDescriptor, ConnectionDescriptor, KafkaDescriptor};

/// Connection-level events that make the connection manager reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionSignal {
    /// The connection was shut down by the broker or the network
    Shutdown,
    /// A client callback raised an error
    CallbackException,
    /// The broker blocked the connection (resource alarm)
    Blocked,
}

impl std::fmt::Display for ConnectionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionSignal::Shutdown => write!(f, "shutdown"),
            ConnectionSignal::CallbackException => write!(f, "callback_exception"),
            ConnectionSignal::Blocked => write!(f, "blocked"),
        }
    }
}

/// Sender half handed to backends for reporting connection signals.
pub type SignalSender = mpsc::UnboundedSender<ConnectionSignal>;

/// Stream of deliveries pushed by the broker for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, BrokerError>>;

/// Extra arguments for a queue binding.
pub type BindArguments = BTreeMap<String, String>;

/// Options for registering a consumer on a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Broker acknowledges on delivery
    pub auto_ack: bool,
    pub no_local: bool,
    pub exclusive: bool,
    pub arguments: BTreeMap<String, String>,
}

/// A live connection plus the receiver of its signals.
pub struct Connected {
    pub connection: Arc<dyn BrokerConnection>,
    pub signals: mpsc::UnboundedReceiver<ConnectionSignal>,
}

/// Something that can open connections.
#[async_trait]
pub trait BrokerBackend: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Open one physical connection. No retries happen here.
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Connected, BrokerError>;
}

/// One physical broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Whether the connection still reports open.
    fn is_open(&self) -> bool;

    /// Peer description for logs.
    fn endpoint(&self) -> String;

    /// Open a logical channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A single-owner logical session on a connection.
///
/// Channels are not safe for concurrent use; callers serialize access.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn bind_queue(
        &self,
        route: &RouteDescriptor,
        arguments: &BindArguments,
    ) -> Result<(), BrokerError>;

    async fn unbind_queue(&self, route: &RouteDescriptor) -> Result<(), BrokerError>;

    /// Put the channel in publisher-confirm mode.
    async fn confirm_select(&self) -> Result<(), BrokerError>;

    /// Publish and wait for the broker's verdict when in confirm mode.
    async fn publish(&self, message: OutboundMessage<'_>) -> Result<PublishOutcome, BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), BrokerError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Stop deliveries for `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Backend used for a profile kind.
///
/// Returns `None` when the crate was built without that backend.
pub fn backend_for(kind: BackendKind) -> Option<Arc<dyn BrokerBackend>> {
    match kind {
        #[cfg(feature = "amqp")]
        BackendKind::Amqp => Some(Arc::new(amqp::AmqpBackend::new())),
        #[cfg(feature = "kafka")]
        BackendKind::Kafka => Some(Arc::new(kafka::KafkaBackend::new())),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}
