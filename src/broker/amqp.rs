//! RabbitMQ backend (lapin).
//!
//! Connection errors are reported as `Shutdown` and channel errors as
//! `CallbackException`. lapin does not surface `connection.blocked`, so the
//! `Blocked` signal never fires for this backend.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::auth::SASLMechanism;
use lapin::message::Delivery as LapinDelivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicRejectOptions, ConfirmSelectOptions, QueueBindOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, warn};

use super::{
    AmqpDescriptor, BindArguments, BrokerBackend, BrokerChannel, BrokerConnection,
    ConnectionDescriptor, ConnectionSignal, ConsumeOptions, Connected, DeliveryStream,
    SignalSender,
};
use crate::broker::factory::{AmqpAuth, AmqpTls};
use crate::error::BrokerError;
use crate::types::{
    InboundDelivery, MessageProperties, OutboundMessage, PublishOutcome, ReturnedMessage,
    RouteDescriptor,
};

/// Reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ through lapin.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpBackend;

impl AmqpBackend {
    pub fn new() -> Self {
        Self
    }
}

fn map_error(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::IOError(e) => BrokerError::Socket(io::Error::new(e.kind(), e.to_string())),
        lapin::Error::InvalidConnectionState(state) => {
            BrokerError::ConnectionClosed(format!("connection is {:?}", state))
        }
        lapin::Error::InvalidChannelState(state) => {
            BrokerError::ConnectionClosed(format!("channel is {:?}", state))
        }
        other => {
            let text = other.to_string();
            if text.contains("ACCESS_REFUSED") {
                BrokerError::AccessRefused(text)
            } else {
                BrokerError::Protocol(text)
            }
        }
    }
}

/// AMQP URI for `descriptor`.
///
/// Built from parts so credentials and vhost never go through a text parser.
pub fn amqp_uri(descriptor: &AmqpDescriptor) -> AMQPUri {
    let userinfo = if descriptor.username.is_empty() {
        AMQPUserInfo::default()
    } else {
        AMQPUserInfo {
            username: descriptor.username.clone(),
            password: descriptor.password.clone(),
        }
    };
    let auth_mechanism = match descriptor.auth {
        AmqpAuth::Plain => None,
        AmqpAuth::External => Some(SASLMechanism::External),
    };
    AMQPUri {
        scheme: if descriptor.tls.is_some() {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo,
            host: descriptor.host.clone(),
            port: descriptor.port,
        },
        vhost: descriptor.virtual_host.clone(),
        query: AMQPQueryString {
            auth_mechanism,
            ..Default::default()
        },
    }
}

fn tls_config(tls: &AmqpTls) -> Result<OwnedTLSConfig, BrokerError> {
    let identity = match &tls.cert_path {
        Some(path) => {
            let der = std::fs::read(path).map_err(|e| {
                BrokerError::Protocol(format!("cannot read client certificate {}: {}", path, e))
            })?;
            Some(OwnedIdentity {
                der,
                password: tls.cert_passphrase.clone(),
            })
        }
        None => None,
    };
    let cert_chain = match &tls.ca_path {
        Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Protocol(format!("cannot read CA bundle {}: {}", path, e))
        })?),
        None => None,
    };
    Ok(OwnedTLSConfig {
        identity,
        cert_chain,
    })
}

#[async_trait]
impl BrokerBackend for AmqpBackend {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Connected, BrokerError> {
        let ConnectionDescriptor::Amqp(descriptor) = descriptor else {
            return Err(BrokerError::Protocol(
                "amqp backend needs an amqp descriptor".to_string(),
            ));
        };

        let uri = amqp_uri(descriptor);
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &descriptor.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connection = match &descriptor.tls {
            Some(tls) => {
                Connection::connect_uri_with_config(uri, properties, tls_config(tls)?).await
            }
            None => Connection::connect_uri(uri, properties).await,
        }
        .map_err(map_error)?;

        let (signals, receiver) = tokio::sync::mpsc::unbounded_channel();
        let on_error = signals.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "AMQP connection error");
            let _ = on_error.send(ConnectionSignal::Shutdown);
        });

        let endpoint = format!("{}:{}", descriptor.host, descriptor.port);
        info!(endpoint = %endpoint, vhost = %descriptor.virtual_host, "AMQP connection opened");

        Ok(Connected {
            connection: Arc::new(AmqpConnection {
                connection,
                endpoint,
                signals,
            }),
            signals: receiver,
        })
    }
}

struct AmqpConnection {
    connection: Connection,
    endpoint: String,
    signals: SignalSender,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.connection.create_channel().await.map_err(map_error)?;
        let signals = self.signals.clone();
        let id = channel.id();
        channel.on_error(move |err| {
            warn!(channel_id = id, error = %err, "AMQP channel error");
            let _ = signals.send(ConnectionSignal::CallbackException);
        });
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(map_error)
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn field_table(arguments: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    table
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(mode) = properties.delivery_mode {
        basic = basic.with_delivery_mode(mode);
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(field_table(&properties.headers));
    }
    basic
}

fn header_text(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        other => format!("{:?}", other),
    }
}

fn message_properties(basic: &BasicProperties) -> MessageProperties {
    MessageProperties {
        delivery_mode: *basic.delivery_mode(),
        content_type: basic.content_type().as_ref().map(|s| s.as_str().to_string()),
        message_id: basic.message_id().as_ref().map(|s| s.as_str().to_string()),
        timestamp: *basic.timestamp(),
        headers: basic
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .map(|(k, v)| (k.as_str().to_string(), header_text(v)))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn inbound(delivery: LapinDelivery) -> InboundDelivery {
    InboundDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: message_properties(&delivery.properties),
        payload: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn bind_queue(
        &self,
        route: &RouteDescriptor,
        arguments: &BindArguments,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                &route.queue,
                &route.exchange,
                &route.routing_key,
                QueueBindOptions::default(),
                field_table(arguments),
            )
            .await
            .map_err(map_error)
    }

    async fn unbind_queue(&self, route: &RouteDescriptor) -> Result<(), BrokerError> {
        self.channel
            .queue_unbind(
                &route.queue,
                &route.exchange,
                &route.routing_key,
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_error)
    }

    async fn publish(&self, message: OutboundMessage<'_>) -> Result<PublishOutcome, BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                message.exchange,
                message.routing_key,
                BasicPublishOptions {
                    mandatory: message.mandatory,
                    ..Default::default()
                },
                message.payload,
                basic_properties(&message.properties),
            )
            .await
            .map_err(map_error)?;

        let outcome = match confirm.await.map_err(map_error)? {
            Confirmation::Ack(None) => PublishOutcome::Acked,
            Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
                PublishOutcome::Returned(ReturnedMessage {
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.as_str().to_string(),
                    exchange: returned.delivery.exchange.as_str().to_string(),
                    routing_key: returned.delivery.routing_key.as_str().to_string(),
                })
            }
            Confirmation::Nack(None) => PublishOutcome::Nacked,
            Confirmation::NotRequested => PublishOutcome::Unconfirmed,
        };
        Ok(outcome)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.auto_ack,
                    no_local: options.no_local,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(map_error)?;
        debug!(queue, consumer_tag, "AMQP consumer registered");

        Ok(consumer
            .map(|item| item.map(inbound).map_err(map_error))
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(map_error)
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(map_error)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(map_error)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_error)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(map_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::build_descriptor;
    use crate::types::{BackendKind, ConnectionProfile, TlsSettings};

    fn descriptor(profile: &ConnectionProfile) -> AmqpDescriptor {
        match build_descriptor(profile).unwrap() {
            ConnectionDescriptor::Amqp(d) => d,
            ConnectionDescriptor::Kafka(_) => panic!("expected amqp descriptor"),
        }
    }

    #[test]
    fn test_plain_uri_keeps_raw_credentials_and_vhost() {
        let profile = ConnectionProfile::new(BackendKind::Amqp, "rabbit.local")
            .with_credentials("relay", "p@ss:word");
        let uri = amqp_uri(&descriptor(&profile));

        assert!(matches!(uri.scheme, AMQPScheme::AMQP));
        assert_eq!(uri.authority.userinfo.username, "relay");
        assert_eq!(uri.authority.userinfo.password, "p@ss:word");
        assert_eq!(uri.authority.host, "rabbit.local");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.vhost, "/");
        assert!(uri.query.auth_mechanism.is_none());
    }

    #[test]
    fn test_tls_uri_uses_external_auth() {
        let mut profile = ConnectionProfile::new(BackendKind::Amqp, "rabbit.local");
        profile.virtual_host = "orders".to_string();
        profile.tls = TlsSettings {
            enabled: true,
            cert_path: "/etc/relay/client.p12".to_string(),
            ..Default::default()
        };
        let uri = amqp_uri(&descriptor(&profile));

        assert!(matches!(uri.scheme, AMQPScheme::AMQPS));
        assert_eq!(uri.authority.port, 5671);
        assert_eq!(uri.vhost, "orders");
        assert!(matches!(
            uri.query.auth_mechanism,
            Some(SASLMechanism::External)
        ));
    }

    #[test]
    fn test_properties_round_trip_through_basic_properties() {
        let properties = MessageProperties::persistent()
            .with_content_type("application/xml")
            .with_header("source", "relay");
        assert_eq!(message_properties(&basic_properties(&properties)), properties);
    }

    #[test]
    fn test_io_errors_are_transient() {
        let err = map_error(lapin::Error::IOError(Arc::new(io::Error::from(
            io::ErrorKind::ConnectionRefused,
        ))));
        assert!(err.is_transient());
    }
}
