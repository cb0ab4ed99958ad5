//! Core types for the relay.

mod config;
mod message;
mod profile;
mod state;

pub use config::{
    BackendSettings, BrokerSettings, ConsumerDefinition, ConsumerSettings, HealthSettings,
    LogSettings, PublisherDefinition, PublisherGroupSettings, PublisherSettings,
    ServicesSettings, Settings, ENV_PREFIX,
};
pub use message::{
    Delivery, DeliveryTag, InboundDelivery, MessageProperties, OutboundMessage, PublishOutcome,
    ReturnedMessage, DELIVERY_MODE_PERSISTENT,
};
pub use profile::{
    BackendKind, ConnectionProfile, ConsumerProfile, PublisherProfile, RouteDescriptor,
    TlsSettings,
};
pub use state::ConnectionState;
