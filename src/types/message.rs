//! Message types shared by every broker backend.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// AMQP delivery mode for messages that survive a broker restart.
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Properties attached to a published or delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// 1 = transient, 2 = persistent
    pub delivery_mode: Option<u8>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// Unix timestamp in seconds
    pub timestamp: Option<u64>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// Persistent properties with a fresh message id and the current time.
    pub fn persistent() -> Self {
        Self {
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            content_type: None,
            message_id: Some(Uuid::new_v4().to_string()),
            timestamp: u64::try_from(Utc::now().timestamp()).ok(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(DELIVERY_MODE_PERSISTENT)
    }
}

/// A message handed to a backend for publishing.
#[derive(Debug, Clone)]
pub struct OutboundMessage<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub mandatory: bool,
    pub properties: MessageProperties,
    pub payload: &'a [u8],
}

/// A delivery tag together with the channel epoch it was issued on.
///
/// Tags are only meaningful on the channel that produced them; once the
/// channel is recreated the epoch changes and old tags are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag {
    pub value: u64,
    pub epoch: u64,
}

/// A message as delivered by the broker to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}

impl Delivery {
    /// Payload decoded as UTF-8, replacing invalid sequences.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// A delivery as produced by a backend, before the channel epoch is attached.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}

impl InboundDelivery {
    pub fn into_delivery(self, epoch: u64) -> Delivery {
        Delivery {
            tag: DeliveryTag {
                value: self.delivery_tag,
                epoch,
            },
            exchange: self.exchange,
            routing_key: self.routing_key,
            redelivered: self.redelivered,
            properties: self.properties,
            payload: self.payload,
        }
    }
}

/// A mandatory message the broker could not route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
}

/// What the broker said about a single publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Confirmed by the broker
    Acked,
    /// Refused by the broker
    Nacked,
    /// Unroutable; returned to the publisher
    Returned(ReturnedMessage),
    /// Sent on a channel that is not in confirm mode
    Unconfirmed,
}

impl PublishOutcome {
    /// Whether the message can be considered handed over to the broker.
    pub fn is_delivered(&self) -> bool {
        matches!(self, PublishOutcome::Acked | PublishOutcome::Unconfirmed)
    }
}
