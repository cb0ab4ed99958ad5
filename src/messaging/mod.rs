//! # Messaging
//!
//! Consume and publish on top of a [`ConnectionManager`](crate::connection::ConnectionManager).
//!
//! ## Components
//! - [`Consumer`]: bind, push-consume with ack-after-handler, explicit
//!   ack/nack/reject scoped to the channel
//! - [`Publisher`]: mandatory publishes with confirm mode and per-call
//!   return/ack/nack callbacks
//! - [`EventHub`]: name-based subscribe/unsubscribe/publish over a queue
//!   and an exchange

pub mod consumer;
pub mod hub;
pub mod publisher;

pub use consumer::{AckPolicy, Consumer, ConsumerOptions, DeliveryHandler};
pub use hub::EventHub;
pub use publisher::{PublishCallbacks, PublishOptions, Publisher};
