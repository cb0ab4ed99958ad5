//! Kafka backend (rdkafka).
//!
//! Kafka has no exchanges or bindings, so the mapping is:
//! exchange = topic, queue = consumer group, routing key = record key.
//! Binding a queue records the topic the group subscribes to. Delivery tags
//! are per-channel sequence numbers; acknowledging one commits its offset and
//! a requeueing nack seeks the partition back to it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    BindArguments, BrokerBackend, BrokerChannel, BrokerConnection, ConnectionDescriptor,
    ConnectionSignal, ConsumeOptions, Connected, DeliveryStream, KafkaDescriptor, SignalSender,
};
use crate::error::BrokerError;
use crate::types::{
    InboundDelivery, MessageProperties, OutboundMessage, PublishOutcome, ReturnedMessage,
    RouteDescriptor,
};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Reply code reported when a record targets a topic that does not exist.
const NO_ROUTE: u16 = 312;

const HEADER_CONTENT_TYPE: &str = "content-type";
const HEADER_MESSAGE_ID: &str = "message-id";
const HEADER_DELIVERY_MODE: &str = "delivery-mode";

/// Kafka through rdkafka.
#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaBackend;

impl KafkaBackend {
    pub fn new() -> Self {
        Self
    }
}

fn map_error(err: KafkaError) -> BrokerError {
    use RDKafkaErrorCode::*;
    match err.rdkafka_error_code() {
        Some(
            AllBrokersDown | BrokerTransportFailure | Resolve | MessageTimedOut
            | OperationTimedOut | BrokerNotAvailable,
        ) => BrokerError::Unreachable(err.to_string()),
        Some(
            Authentication
            | SaslAuthenticationFailed
            | TopicAuthorizationFailed
            | GroupAuthorizationFailed
            | ClusterAuthorizationFailed,
        ) => BrokerError::AccessRefused(err.to_string()),
        _ => BrokerError::Protocol(err.to_string()),
    }
}

/// Client context forwarding librdkafka errors as connection signals.
#[derive(Clone)]
struct RelayContext {
    signals: SignalSender,
}

impl ClientContext for RelayContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!(error = %error, reason, "Kafka client error");
        let signal = match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::AllBrokersDown) => ConnectionSignal::Shutdown,
            _ => ConnectionSignal::CallbackException,
        };
        let _ = self.signals.send(signal);
    }
}

impl ConsumerContext for RelayContext {}

fn client_config(descriptor: &KafkaDescriptor) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in &descriptor.properties {
        config.set(key, value);
    }
    config
}

#[async_trait]
impl BrokerBackend for KafkaBackend {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Connected, BrokerError> {
        let ConnectionDescriptor::Kafka(descriptor) = descriptor else {
            return Err(BrokerError::Protocol(
                "kafka backend needs a kafka descriptor".to_string(),
            ));
        };

        let (signals, receiver) = tokio::sync::mpsc::unbounded_channel();
        let context = RelayContext {
            signals: signals.clone(),
        };

        let producer: FutureProducer<RelayContext> = client_config(descriptor)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .create_with_context(context.clone())
            .map_err(map_error)?;

        // librdkafka connects lazily; a metadata round trip proves reachability.
        let client = producer.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            client.client().fetch_metadata(None, METADATA_TIMEOUT)
        })
        .await
        .map_err(|e| BrokerError::Protocol(format!("metadata fetch panicked: {}", e)))?
        .map_err(map_error)?;

        let endpoint = descriptor
            .get("bootstrap.servers")
            .unwrap_or_default()
            .to_string();
        info!(
            endpoint = %endpoint,
            brokers = metadata.brokers().len(),
            topics = metadata.topics().len(),
            "Kafka connection opened"
        );

        Ok(Connected {
            connection: Arc::new(KafkaConnection {
                descriptor: descriptor.clone(),
                producer,
                context,
                endpoint,
                open: AtomicBool::new(true),
            }),
            signals: receiver,
        })
    }
}

struct KafkaConnection {
    descriptor: KafkaDescriptor,
    producer: FutureProducer<RelayContext>,
    context: RelayContext,
    endpoint: String,
    open: AtomicBool,
}

#[async_trait]
impl BrokerConnection for KafkaConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::ConnectionClosed(
                "kafka connection is closed".to_string(),
            ));
        }
        Ok(Arc::new(KafkaChannel {
            descriptor: self.descriptor.clone(),
            producer: self.producer.clone(),
            context: self.context.clone(),
            open: AtomicBool::new(true),
            confirm: AtomicBool::new(false),
            topics: Mutex::new(BTreeSet::new()),
            consumers: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_tag: Arc::new(AtomicU64::new(1)),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let producer = self.producer.clone();
        let flushed = tokio::task::spawn_blocking(move || producer.flush(SEND_TIMEOUT)).await;
        if let Ok(Err(e)) = flushed {
            warn!(error = %e, "Kafka producer flush failed on close");
        }
        Ok(())
    }
}

/// Where an unsettled delivery lives.
#[derive(Debug, Clone)]
struct PendingOffset {
    consumer_tag: String,
    topic: String,
    partition: i32,
    offset: i64,
}

struct ActiveConsumer {
    consumer: Arc<StreamConsumer<RelayContext>>,
    cancel: CancellationToken,
}

struct KafkaChannel {
    descriptor: KafkaDescriptor,
    producer: FutureProducer<RelayContext>,
    context: RelayContext,
    open: AtomicBool,
    confirm: AtomicBool,
    topics: Mutex<BTreeSet<String>>,
    consumers: Mutex<HashMap<String, ActiveConsumer>>,
    pending: Arc<Mutex<HashMap<u64, PendingOffset>>>,
    next_tag: Arc<AtomicU64>,
}

impl KafkaChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed("kafka channel is closed".to_string()))
        }
    }

    fn subscribed_topics(&self) -> Vec<String> {
        self.topics
            .lock()
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Re-subscribe running consumers after the topic set changed.
    fn resubscribe(&self) -> Result<(), BrokerError> {
        let topics = self.subscribed_topics();
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        let consumers = self
            .consumers
            .lock()
            .map_err(|_| BrokerError::Protocol("consumer table poisoned".to_string()))?;
        for active in consumers.values() {
            if refs.is_empty() {
                active.consumer.unsubscribe();
            } else {
                active.consumer.subscribe(&refs).map_err(map_error)?;
            }
        }
        Ok(())
    }

    /// Remove the pending entries settled by `delivery_tag`.
    fn take_pending(&self, delivery_tag: u64, multiple: bool) -> Result<Vec<PendingOffset>, BrokerError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| BrokerError::Protocol("pending table poisoned".to_string()))?;
        let tags: Vec<u64> = if multiple {
            pending.keys().copied().filter(|t| *t <= delivery_tag).collect()
        } else {
            vec![delivery_tag]
        };
        let taken: Vec<PendingOffset> = tags.iter().filter_map(|t| pending.remove(t)).collect();
        if taken.is_empty() {
            return Err(BrokerError::Protocol(format!(
                "unknown delivery tag {}",
                delivery_tag
            )));
        }
        Ok(taken)
    }

    fn consumer_for(&self, consumer_tag: &str) -> Option<Arc<StreamConsumer<RelayContext>>> {
        self.consumers
            .lock()
            .ok()
            .and_then(|c| c.get(consumer_tag).map(|a| a.consumer.clone()))
    }

    fn commit(&self, offsets: &[PendingOffset]) -> Result<(), BrokerError> {
        for entry in offsets {
            let Some(consumer) = self.consumer_for(&entry.consumer_tag) else {
                continue;
            };
            let mut list = TopicPartitionList::new();
            list.add_partition_offset(&entry.topic, entry.partition, Offset::Offset(entry.offset + 1))
                .map_err(map_error)?;
            consumer.commit(&list, CommitMode::Async).map_err(map_error)?;
        }
        Ok(())
    }

    fn rewind(&self, offsets: &[PendingOffset]) -> Result<(), BrokerError> {
        for entry in offsets {
            let Some(consumer) = self.consumer_for(&entry.consumer_tag) else {
                continue;
            };
            consumer
                .seek(&entry.topic, entry.partition, Offset::Offset(entry.offset), SEEK_TIMEOUT)
                .map_err(map_error)?;
        }
        Ok(())
    }
}

fn record_headers(properties: &MessageProperties) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new();
    let mode = properties.delivery_mode.map(|m| m.to_string());
    let well_known = [
        (HEADER_CONTENT_TYPE, properties.content_type.as_deref()),
        (HEADER_MESSAGE_ID, properties.message_id.as_deref()),
        (HEADER_DELIVERY_MODE, mode.as_deref()),
    ];
    for (key, value) in well_known {
        if let Some(value) = value {
            headers = headers.insert(Header {
                key,
                value: Some(value),
            });
        }
    }
    for (key, value) in &properties.headers {
        headers = headers.insert(Header {
            key: key.as_str(),
            value: Some(value.as_str()),
        });
    }
    headers
}

fn inbound(message: &BorrowedMessage<'_>, delivery_tag: u64) -> InboundDelivery {
    let mut properties = MessageProperties::default();
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            let value = header
                .value
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            match header.key {
                HEADER_CONTENT_TYPE => properties.content_type = Some(value),
                HEADER_MESSAGE_ID => properties.message_id = Some(value),
                HEADER_DELIVERY_MODE => properties.delivery_mode = value.parse().ok(),
                key => {
                    properties.headers.insert(key.to_string(), value);
                }
            }
        }
    }
    properties.timestamp = message
        .timestamp()
        .to_millis()
        .and_then(|ms| u64::try_from(ms / 1000).ok());

    InboundDelivery {
        delivery_tag,
        exchange: message.topic().to_string(),
        routing_key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default(),
        redelivered: false,
        properties,
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

#[async_trait]
impl BrokerChannel for KafkaChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn bind_queue(
        &self,
        route: &RouteDescriptor,
        _arguments: &BindArguments,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let added = self
            .topics
            .lock()
            .map_err(|_| BrokerError::Protocol("topic table poisoned".to_string()))?
            .insert(route.exchange.clone());
        if added {
            debug!(topic = %route.exchange, group = %route.queue, "Kafka topic bound");
            self.resubscribe()?;
        }
        Ok(())
    }

    async fn unbind_queue(&self, route: &RouteDescriptor) -> Result<(), BrokerError> {
        self.ensure_open()?;
        // One topic serves every routing key; the topic stays while keys remain.
        debug!(topic = %route.exchange, key = %route.routing_key, "Kafka unbind is a no-op");
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.confirm.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage<'_>) -> Result<PublishOutcome, BrokerError> {
        self.ensure_open()?;
        let mut record = FutureRecord::to(message.exchange)
            .payload(message.payload)
            .headers(record_headers(&message.properties));
        if !message.routing_key.is_empty() {
            record = record.key(message.routing_key);
        }
        if let Some(seconds) = message.properties.timestamp {
            record = record.timestamp(seconds as i64 * 1000);
        }

        match self.producer.send(record, SEND_TIMEOUT).await {
            Ok((partition, offset)) => {
                debug!(topic = message.exchange, partition, offset, "Kafka record delivered");
                Ok(if self.confirm.load(Ordering::SeqCst) {
                    PublishOutcome::Acked
                } else {
                    PublishOutcome::Unconfirmed
                })
            }
            Err((err, _)) => match err.rdkafka_error_code() {
                Some(RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic) => {
                    Ok(PublishOutcome::Returned(ReturnedMessage {
                        reply_code: NO_ROUTE,
                        reply_text: err.to_string(),
                        exchange: message.exchange.to_string(),
                        routing_key: message.routing_key.to_string(),
                    }))
                }
                _ => match map_error(err) {
                    transient if transient.is_transient() => Err(transient),
                    other => {
                        warn!(topic = message.exchange, error = %other, "Kafka record refused");
                        Ok(PublishOutcome::Nacked)
                    }
                },
            },
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let topics = self.subscribed_topics();
        if topics.is_empty() {
            return Err(BrokerError::Protocol(format!(
                "no topic bound for consumer group '{}'",
                queue
            )));
        }

        let mut config = client_config(&self.descriptor);
        config
            .set("group.id", queue)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", if options.auto_ack { "true" } else { "false" });
        for (key, value) in &options.arguments {
            config.set(key, value);
        }
        let consumer: StreamConsumer<RelayContext> = config
            .create_with_context(self.context.clone())
            .map_err(map_error)?;
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&refs).map_err(map_error)?;
        let consumer = Arc::new(consumer);

        let cancel = CancellationToken::new();
        {
            let mut consumers = self
                .consumers
                .lock()
                .map_err(|_| BrokerError::Protocol("consumer table poisoned".to_string()))?;
            if consumers.contains_key(consumer_tag) {
                return Err(BrokerError::Protocol(format!(
                    "consumer tag '{}' already in use",
                    consumer_tag
                )));
            }
            consumers.insert(
                consumer_tag.to_string(),
                ActiveConsumer {
                    consumer: consumer.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        info!(group = queue, consumer_tag, topics = ?topics, "Kafka consumer subscribed");

        let state = (
            consumer,
            cancel,
            self.pending.clone(),
            self.next_tag.clone(),
            consumer_tag.to_string(),
            options.auto_ack,
        );
        let deliveries = stream::unfold(state, |state| async move {
            let (consumer, cancel, pending, next_tag, consumer_tag, auto_ack) = state;
            let item = tokio::select! {
                _ = cancel.cancelled() => return None,
                received = consumer.recv() => match received {
                    Ok(message) => {
                        let tag = next_tag.fetch_add(1, Ordering::SeqCst);
                        if !auto_ack {
                            if let Ok(mut pending) = pending.lock() {
                                pending.insert(tag, PendingOffset {
                                    consumer_tag: consumer_tag.clone(),
                                    topic: message.topic().to_string(),
                                    partition: message.partition(),
                                    offset: message.offset(),
                                });
                            }
                        }
                        Ok(inbound(&message, tag))
                    }
                    Err(e) => Err(map_error(e)),
                },
            };
            Some((item, (consumer, cancel, pending, next_tag, consumer_tag, auto_ack)))
        });
        Ok(Box::pin(deliveries))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let settled = self.take_pending(delivery_tag, multiple)?;
        self.commit(&settled)
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let settled = self.take_pending(delivery_tag, multiple)?;
        if requeue {
            self.rewind(&settled)
        } else {
            self.commit(&settled)
        }
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.nack(delivery_tag, false, requeue).await
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let removed = self
            .consumers
            .lock()
            .map_err(|_| BrokerError::Protocol("consumer table poisoned".to_string()))?
            .remove(consumer_tag);
        if let Some(active) = removed {
            active.cancel.cancel();
            active.consumer.unsubscribe();
            if let Ok(mut pending) = self.pending.lock() {
                pending.retain(|_, p| p.consumer_tag != consumer_tag);
            }
            debug!(consumer_tag, "Kafka consumer cancelled");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let drained: Vec<ActiveConsumer> = self
            .consumers
            .lock()
            .map(|mut c| c.drain().map(|(_, a)| a).collect())
            .unwrap_or_default();
        for active in drained {
            active.cancel.cancel();
            active.consumer.unsubscribe();
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        Ok(())
    }
}
