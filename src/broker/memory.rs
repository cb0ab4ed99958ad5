//! In-process broker.
//!
//! Implements direct-exchange routing, per-channel delivery tags, publisher
//! confirms, mandatory returns and requeue on nack/reject or channel loss.
//! Failures (unreachable broker, refused credentials, socket errors on
//! publish, errors in a consumer stream, connection signals) can be
//! injected, which makes this backend the test double for the connection
//! manager, consumer and publisher.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    BindArguments, BrokerBackend, BrokerChannel, BrokerConnection, ConnectionDescriptor,
    ConnectionSignal, ConsumeOptions, Connected, DeliveryStream, SignalSender,
};
use crate::error::BrokerError;
use crate::types::{
    InboundDelivery, MessageProperties, OutboundMessage, PublishOutcome, ReturnedMessage,
    RouteDescriptor,
};

/// AMQP reply code for an unroutable mandatory message.
pub const NO_ROUTE: u16 = 312;

type DeliverySender = mpsc::UnboundedSender<Result<InboundDelivery, BrokerError>>;

/// What a consumer did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

/// One acknowledgment received by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub kind: AckKind,
    pub delivery_tag: u64,
    pub multiple: bool,
}

/// One publish that reached the broker.
#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
    pub outcome: PublishOutcome,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: MessageProperties,
    payload: Vec<u8>,
}

struct ConsumerEntry {
    channel_id: u64,
    tag: String,
    auto_ack: bool,
    sender: DeliverySender,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
}

struct ChannelEntry {
    connection_id: u64,
    next_tag: u64,
    confirm: bool,
    open: Arc<AtomicBool>,
}

struct ConnectionEntry {
    signals: SignalSender,
    open: Arc<AtomicBool>,
}

struct Unacked {
    channel_id: u64,
    tag: u64,
    queue: String,
    message: StoredMessage,
}

struct BrokerState {
    reachable: bool,
    refuse_credentials: bool,
    publish_failures: u32,
    nack_publishes: bool,
    connect_attempts: u64,
    next_id: u64,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    bindings: Vec<RouteDescriptor>,
    queues: HashMap<String, QueueState>,
    unacked: Vec<Unacked>,
    acks: Vec<AckRecord>,
    published: Vec<PublishedRecord>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&mut self, message: StoredMessage) -> usize {
        let queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == message.exchange && b.routing_key == message.routing_key)
            .map(|b| b.queue.clone())
            .collect();
        for queue in &queues {
            self.queues
                .entry(queue.clone())
                .or_default()
                .ready
                .push_back(message.clone());
            self.dispatch(queue);
        }
        queues.len()
    }

    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        queue.consumers.retain(|c| !c.sender.is_closed());

        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            // Rotate consumers for round-robin delivery.
            let consumer = queue.consumers.remove(0);
            let Some(channel) = self.channels.get_mut(&consumer.channel_id) else {
                queue.ready.push_front(message);
                continue;
            };
            channel.next_tag += 1;
            let tag = channel.next_tag;

            let delivery = InboundDelivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                payload: message.payload.clone(),
            };

            if consumer.sender.send(Ok(delivery)).is_err() {
                queue.ready.push_front(message);
                continue;
            }
            if !consumer.auto_ack {
                self.unacked.push(Unacked {
                    channel_id: consumer.channel_id,
                    tag,
                    queue: queue_name.to_string(),
                    message,
                });
            }
            queue.consumers.push(consumer);
        }
    }

    fn requeue(&mut self, entries: Vec<Unacked>) {
        let mut touched = Vec::new();
        for entry in entries.into_iter().rev() {
            let mut message = entry.message;
            message.redelivered = true;
            self.queues
                .entry(entry.queue.clone())
                .or_default()
                .ready
                .push_front(message);
            if !touched.contains(&entry.queue) {
                touched.push(entry.queue);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn take_unacked(&mut self, channel_id: u64, tag: u64, multiple: bool) -> Vec<Unacked> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.unacked)
            .into_iter()
            .partition(|u| {
                u.channel_id == channel_id && (u.tag == tag || (multiple && u.tag < tag))
            });
        self.unacked = kept;
        taken
    }

    fn close_channel(&mut self, channel_id: u64) {
        if let Some(channel) = self.channels.remove(&channel_id) {
            channel.open.store(false, Ordering::SeqCst);
        }
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }
        let (lost, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.unacked)
            .into_iter()
            .partition(|u| u.channel_id == channel_id);
        self.unacked = kept;
        self.requeue(lost);
    }

    fn close_connection(&mut self, connection_id: u64) {
        if let Some(connection) = self.connections.remove(&connection_id) {
            connection.open.store(false, Ordering::SeqCst);
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channels {
            self.close_channel(channel_id);
        }
    }
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a reachable, empty broker.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                refuse_credentials: false,
                publish_failures: 0,
                nack_publishes: false,
                connect_attempts: 0,
                next_id: 0,
                connections: HashMap::new(),
                channels: HashMap::new(),
                bindings: Vec::new(),
                queues: HashMap::new(),
                unacked: Vec::new(),
                acks: Vec::new(),
                published: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make connection attempts fail with an unreachable error.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Make connection attempts fail with access refused.
    pub fn set_refuse_credentials(&self, refuse: bool) {
        self.lock().refuse_credentials = refuse;
    }

    /// Fail the next `count` publishes with a socket error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().publish_failures = count;
    }

    /// Nack every publish on confirm-mode channels.
    pub fn set_nack_publishes(&self, nack: bool) {
        self.lock().nack_publishes = nack;
    }

    /// Number of connection attempts seen so far, failed or not.
    pub fn connect_attempts(&self) -> u64 {
        self.lock().connect_attempts
    }

    /// Number of currently open connections.
    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Raise `signal` on every open connection.
    ///
    /// `Shutdown` also closes the connections and their channels.
    pub fn fire(&self, signal: ConnectionSignal) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            if let Some(connection) = state.connections.get(&id) {
                let _ = connection.signals.send(signal);
            }
            if signal == ConnectionSignal::Shutdown {
                state.close_connection(id);
            }
        }
    }

    /// Declare a binding without a client.
    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) {
        let mut state = self.lock();
        let route = RouteDescriptor::new(queue, exchange, routing_key);
        if !state.bindings.contains(&route) {
            state.bindings.push(route);
        }
        state.queues.entry(queue.to_string()).or_default();
    }

    /// Whether `queue` is bound to `exchange` with `routing_key`.
    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.lock()
            .bindings
            .contains(&RouteDescriptor::new(queue, exchange, routing_key))
    }

    /// Publish from outside any client, as another producer would.
    ///
    /// Returns the number of queues the message was routed to.
    pub fn deliver(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> usize {
        self.lock().route(StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
            properties: MessageProperties::persistent(),
            payload: payload.to_vec(),
        })
    }

    /// Push a broker-side error into every consumer stream of `queue`.
    ///
    /// Returns the number of consumers that received it.
    pub fn inject_consume_error(&self, queue: &str) -> usize {
        let state = self.lock();
        let Some(queue_state) = state.queues.get(queue) else {
            return 0;
        };
        queue_state
            .consumers
            .iter()
            .filter(|c| {
                c.sender
                    .send(Err(BrokerError::Protocol(format!(
                        "injected consume failure on '{}'",
                        queue
                    ))))
                    .is_ok()
            })
            .count()
    }

    /// Messages waiting in `queue` (not delivered or requeued).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Delivered but not yet acknowledged messages.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Consumers registered on `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.iter().filter(|c| !c.sender.is_closed()).count())
    }

    /// Every acknowledgment received so far.
    pub fn acks(&self) -> Vec<AckRecord> {
        self.lock().acks.clone()
    }

    /// Every publish received so far.
    pub fn published(&self) -> Vec<PublishedRecord> {
        self.lock().published.clone()
    }
}

#[async_trait]
impl BrokerBackend for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Connected, BrokerError> {
        let mut state = self.lock();
        state.connect_attempts += 1;

        if !state.reachable {
            return Err(BrokerError::Unreachable(format!(
                "{} is not reachable",
                descriptor.display_host()
            )));
        }
        if state.refuse_credentials {
            return Err(BrokerError::AccessRefused(
                "ACCESS_REFUSED - login was refused".to_string(),
            ));
        }

        let id = state.next_id();
        let open = Arc::new(AtomicBool::new(true));
        let (signals, receiver) = mpsc::unbounded_channel();
        state.connections.insert(
            id,
            ConnectionEntry {
                signals,
                open: open.clone(),
            },
        );
        debug!(connection_id = id, "Memory broker accepted connection");

        Ok(Connected {
            connection: Arc::new(MemoryConnection {
                id,
                endpoint: descriptor.display_host(),
                open,
                broker: self.clone(),
            }),
            signals: receiver,
        })
    }
}

struct MemoryConnection {
    id: u64,
    endpoint: String,
    open: Arc<AtomicBool>,
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::ConnectionClosed("connection is closed".to_string()));
        }
        let mut state = self.broker.lock();
        let id = state.next_id();
        let open = Arc::new(AtomicBool::new(true));
        state.channels.insert(
            id,
            ChannelEntry {
                connection_id: self.id,
                next_tag: 0,
                confirm: false,
                open: open.clone(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            id,
            open,
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.lock().close_connection(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    open: Arc<AtomicBool>,
    broker: MemoryBroker,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed("channel is closed".to_string()))
        }
    }

    fn settle(&self, kind: AckKind, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let taken = state.take_unacked(self.id, delivery_tag, multiple);
        if taken.is_empty() {
            return Err(BrokerError::Protocol(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            )));
        }
        state.acks.push(AckRecord {
            kind,
            delivery_tag,
            multiple,
        });
        match kind {
            AckKind::Nack { requeue: true } | AckKind::Reject { requeue: true } => {
                state.requeue(taken)
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn bind_queue(
        &self,
        route: &RouteDescriptor,
        _arguments: &BindArguments,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker
            .bind(&route.queue, &route.exchange, &route.routing_key);
        Ok(())
    }

    async fn unbind_queue(&self, route: &RouteDescriptor) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.lock().bindings.retain(|b| b != route);
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if let Some(channel) = self.broker.lock().channels.get_mut(&self.id) {
            channel.confirm = true;
        }
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage<'_>) -> Result<PublishOutcome, BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(BrokerError::Socket(io::Error::from(
                io::ErrorKind::ConnectionReset,
            )));
        }

        let confirm = state.channels.get(&self.id).is_some_and(|c| c.confirm);
        let routable = state
            .bindings
            .iter()
            .any(|b| b.exchange == message.exchange && b.routing_key == message.routing_key);

        let outcome = if !routable && message.mandatory {
            PublishOutcome::Returned(ReturnedMessage {
                reply_code: NO_ROUTE,
                reply_text: "NO_ROUTE".to_string(),
                exchange: message.exchange.to_string(),
                routing_key: message.routing_key.to_string(),
            })
        } else if confirm && state.nack_publishes {
            PublishOutcome::Nacked
        } else {
            state.route(StoredMessage {
                exchange: message.exchange.to_string(),
                routing_key: message.routing_key.to_string(),
                redelivered: false,
                properties: message.properties.clone(),
                payload: message.payload.to_vec(),
            });
            if confirm {
                PublishOutcome::Acked
            } else {
                PublishOutcome::Unconfirmed
            }
        };

        state.published.push(PublishedRecord {
            exchange: message.exchange.to_string(),
            routing_key: message.routing_key.to_string(),
            mandatory: message.mandatory,
            properties: message.properties,
            payload: message.payload.to_vec(),
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.lock();
            let entry = state.queues.entry(queue.to_string()).or_default();
            entry.consumers.push(ConsumerEntry {
                channel_id: self.id,
                tag: consumer_tag.to_string(),
                auto_ack: options.auto_ack,
                sender,
            });
            state.dispatch(queue);
        }

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        self.settle(AckKind::Ack, delivery_tag, multiple)
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.settle(AckKind::Nack { requeue }, delivery_tag, multiple)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.settle(AckKind::Reject { requeue }, delivery_tag, false)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel_id == self.id && c.tag == consumer_tag));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}
