//! Queue consumer.
//!
//! Binds its queue, registers a push consumer on its own channel and runs
//! the delivery loop on a tokio task. Deliveries are acknowledged after the
//! handler returns, also when the handler failed: there is no dead-letter
//! routing, so a failing message is logged and dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{self, BindArguments, DeliveryStream};
use crate::connection::{ChannelLease, ChannelSlot, ConnectionManager};
use crate::error::{RelayError, Result};
use crate::subscriptions::SubscriptionRegistry;
use crate::types::{ConsumerProfile, Delivery, DeliveryTag, RouteDescriptor};

/// Receives deliveries from a [`Consumer`].
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

/// Who acknowledges deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// The consumer acks each delivery once the handler returned
    #[default]
    AfterHandler,
    /// The handler acks through [`Consumer::ack`] and friends
    Manual,
}

/// Options for [`Consumer::consume`].
#[derive(Debug, Clone, Default)]
pub struct ConsumerOptions {
    pub ack_policy: AckPolicy,
    pub exclusive: bool,
    pub arguments: BTreeMap<String, String>,
}

struct ActiveLoop {
    generation: u64,
    token: CancellationToken,
}

enum Next {
    Delivery(Delivery),
    Ended,
    Stopped,
}

/// Consumer bound to one queue.
pub struct Consumer {
    name: String,
    route: RouteDescriptor,
    profile: ConsumerProfile,
    slot: ChannelSlot,
    registry: Option<Arc<SubscriptionRegistry>>,
    bindings: Mutex<BTreeMap<String, BindArguments>>,
    active: Mutex<Option<ActiveLoop>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl Consumer {
    pub fn new(
        name: &str,
        manager: Arc<ConnectionManager>,
        route: RouteDescriptor,
        profile: ConsumerProfile,
    ) -> Result<Self> {
        if route.queue.trim().is_empty() {
            return Err(RelayError::InvalidConfiguration(format!(
                "consumer '{}' has no queue",
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            route,
            profile,
            slot: ChannelSlot::new(manager),
            registry: None,
            bindings: Mutex::new(BTreeMap::new()),
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Only dispatch deliveries whose routing key is subscribed.
    pub fn with_registry(mut self, registry: Arc<SubscriptionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Stop the delivery loop when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn route(&self) -> &RouteDescriptor {
        &self.route
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        self.slot.manager()
    }

    fn bindings(&self) -> MutexGuard<'_, BTreeMap<String, BindArguments>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveLoop>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_disposed(&self) -> Result<()> {
        if self.manager().is_disposed() {
            Err(RelayError::Disposed)
        } else {
            Ok(())
        }
    }

    pub fn is_bound(&self) -> bool {
        !self.bindings().is_empty()
    }

    pub fn is_consuming(&self) -> bool {
        self.active().is_some()
    }

    /// Bind the queue to the exchange with the configured routing key.
    ///
    /// Idempotent. Reconnects first when needed.
    pub async fn bind_queue(&self, arguments: BindArguments) -> Result<()> {
        let key = self.route.routing_key.clone();
        self.bind_routing_key(&key, arguments).await
    }

    /// Bind the queue to the exchange with `routing_key`.
    pub async fn bind_routing_key(&self, routing_key: &str, arguments: BindArguments) -> Result<()> {
        self.check_disposed()?;
        let route = self.route_for(routing_key);
        let lease = self.slot.lease().await?;
        lease.channel().bind_queue(&route, &arguments).await?;
        self.bindings().insert(routing_key.to_string(), arguments);

        info!(
            consumer = %self.name,
            queue = %route.queue,
            exchange = %route.exchange,
            routing_key,
            "Queue bound"
        );
        Ok(())
    }

    /// Remove the binding for `routing_key`.
    pub async fn unbind_routing_key(&self, routing_key: &str) -> Result<()> {
        self.check_disposed()?;
        self.bindings().remove(routing_key);
        let route = self.route_for(routing_key);
        let lease = self.slot.lease().await?;
        lease.channel().unbind_queue(&route).await?;

        info!(consumer = %self.name, queue = %route.queue, routing_key, "Queue unbound");
        Ok(())
    }

    fn route_for(&self, routing_key: &str) -> RouteDescriptor {
        RouteDescriptor::new(&self.route.queue, &self.route.exchange, routing_key)
    }

    /// Start the delivery loop.
    ///
    /// Requires a successful bind. The returned task ends on `cancel`, on
    /// shutdown or when the connection manager is disposed.
    pub fn consume(
        self: &Arc<Self>,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumerOptions,
    ) -> Result<JoinHandle<()>> {
        self.check_disposed()?;
        if self.profile.consumer_tag.trim().is_empty() {
            return Err(RelayError::InvalidArgument(
                "consumer tag must not be empty".to_string(),
            ));
        }
        if !self.is_bound() {
            return Err(RelayError::NotBound);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.shutdown.child_token();
        {
            let mut active = self.active();
            if active.is_some() {
                return Err(RelayError::InvalidArgument(format!(
                    "consumer '{}' is already consuming",
                    self.name
                )));
            }
            *active = Some(ActiveLoop {
                generation,
                token: token.clone(),
            });
        }

        let consumer = self.clone();
        Ok(tokio::spawn(async move {
            consumer.run(handler, options, token).await;
            let mut active = consumer.active();
            if active.as_ref().is_some_and(|a| a.generation == generation) {
                *active = None;
            }
        }))
    }

    async fn run(&self, handler: Arc<dyn DeliveryHandler>, options: ConsumerOptions, token: CancellationToken) {
        let manager = self.manager().clone();

        'register: loop {
            if token.is_cancelled() {
                break;
            }

            let (mut stream, channel_id) = match self.register(&options).await {
                Ok(registered) => registered,
                Err(RelayError::Disposed) => break,
                Err(e) => {
                    warn!(consumer = %self.name, error = %e, "Could not register consumer");
                    if !self.wait_for_recovery(&token).await {
                        break;
                    }
                    continue;
                }
            };
            info!(
                consumer = %self.name,
                queue = %self.route.queue,
                tag = %self.profile.consumer_tag,
                channel_id,
                "Consumer registered"
            );

            loop {
                match self.next(&mut stream, channel_id, &token).await {
                    Next::Delivery(delivery) => self.dispatch(delivery, handler.as_ref(), &options).await,
                    Next::Stopped => break 'register,
                    Next::Ended => {
                        warn!(consumer = %self.name, "Delivery stream ended, re-registering");
                        if !manager.wait_until_connected(&token).await {
                            break 'register;
                        }
                        continue 'register;
                    }
                }
            }
        }

        info!(consumer = %self.name, "Consumer stopped");
    }

    async fn next(&self, stream: &mut DeliveryStream, channel_id: u64, token: &CancellationToken) -> Next {
        loop {
            let item = tokio::select! {
                _ = token.cancelled() => return Next::Stopped,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(inbound)) => return Next::Delivery(inbound.into_delivery(channel_id)),
                Some(Err(e)) => {
                    error!(consumer = %self.name, error = %e, "Broker reported a consume error");
                }
                None => return Next::Ended,
            }
        }
    }

    async fn register(&self, options: &ConsumerOptions) -> Result<(DeliveryStream, u64)> {
        self.check_disposed()?;
        let lease = self.slot.lease().await?;
        if lease.is_fresh() {
            self.rebind(&lease).await?;
        }

        let broker_options = broker::ConsumeOptions {
            auto_ack: self.profile.auto_ack,
            no_local: false,
            exclusive: options.exclusive,
            arguments: options.arguments.clone(),
        };
        let stream = lease
            .channel()
            .consume(&self.route.queue, &self.profile.consumer_tag, &broker_options)
            .await?;
        Ok((stream, lease.handle().id()))
    }

    async fn rebind(&self, lease: &ChannelLease<'_>) -> Result<()> {
        let bindings: Vec<(String, BindArguments)> = self
            .bindings()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, arguments) in bindings {
            lease
                .channel()
                .bind_queue(&self.route_for(&key), &arguments)
                .await?;
        }
        Ok(())
    }

    async fn wait_for_recovery(&self, token: &CancellationToken) -> bool {
        let manager = self.manager();
        let delay = manager.retry_wait();
        if manager.is_connected() {
            tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            }
        } else {
            // Retry through `lease` once the wait is over, even while faulted.
            tokio::select! {
                connected = manager.wait_until_connected(token) => connected,
                _ = tokio::time::sleep(delay) => !token.is_cancelled(),
            }
        }
    }

    async fn dispatch(&self, delivery: Delivery, handler: &dyn DeliveryHandler, options: &ConsumerOptions) {
        let auto_ack = self.profile.auto_ack;

        if let Some(registry) = &self.registry {
            if !registry.has_subscriptions_for_event(&delivery.routing_key) {
                warn!(
                    consumer = %self.name,
                    routing_key = %delivery.routing_key,
                    "No subscription for event"
                );
                if !auto_ack {
                    self.ack_logged(delivery.tag).await;
                }
                return;
            }
        }

        debug!(
            consumer = %self.name,
            tag = delivery.tag.value,
            redelivered = delivery.redelivered,
            bytes = delivery.payload.len(),
            "Processing delivery"
        );
        if let Err(e) = handler.handle(&delivery).await {
            error!(
                consumer = %self.name,
                tag = delivery.tag.value,
                error = %e,
                "Delivery handler failed"
            );
        }

        if !auto_ack && options.ack_policy == AckPolicy::AfterHandler {
            self.ack_logged(delivery.tag).await;
        }
    }

    async fn ack_logged(&self, tag: DeliveryTag) {
        if let Err(e) = self.ack(tag, false).await {
            error!(consumer = %self.name, tag = tag.value, error = %e, "Could not acknowledge delivery");
        }
    }

    async fn settle_lease(&self, tag: DeliveryTag) -> Result<ChannelLease<'_>> {
        self.check_disposed()?;
        let lease = self.slot.lease_existing().await?;
        let current = lease.handle().id();
        if current != tag.epoch {
            return Err(RelayError::StaleDeliveryTag {
                tag: tag.value,
                epoch: tag.epoch,
                current,
            });
        }
        Ok(lease)
    }

    pub async fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<()> {
        let lease = self.settle_lease(tag).await?;
        lease.channel().ack(tag.value, multiple).await?;
        Ok(())
    }

    pub async fn nack(&self, tag: DeliveryTag, multiple: bool, requeue: bool) -> Result<()> {
        let lease = self.settle_lease(tag).await?;
        lease.channel().nack(tag.value, multiple, requeue).await?;
        Ok(())
    }

    pub async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let lease = self.settle_lease(tag).await?;
        lease.channel().reject(tag.value, requeue).await?;
        Ok(())
    }

    /// Stop the delivery loop and cancel the broker-side consumer.
    ///
    /// Does nothing when not consuming.
    pub async fn cancel(&self) {
        let Some(active) = self.active().take() else {
            return;
        };
        active.token.cancel();

        if let Ok(lease) = self.slot.lease_existing().await {
            if let Err(e) = lease.channel().cancel(&self.profile.consumer_tag).await {
                debug!(consumer = %self.name, error = %e, "Broker-side cancel failed");
            }
        }
        info!(consumer = %self.name, tag = %self.profile.consumer_tag, "Consumer cancelled");
    }

    /// Cancel and close the channel.
    pub async fn close(&self) {
        self.cancel().await;
        self.slot.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{AckKind, MemoryBroker};
    use crate::broker::ConnectionSignal;
    use crate::types::{BackendKind, ConnectionProfile};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Recorder {
        seen: mpsc::UnboundedSender<Delivery>,
        fail: bool,
    }

    #[async_trait]
    impl DeliveryHandler for Recorder {
        async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
            let _ = self.seen.send(delivery.clone());
            if self.fail {
                anyhow::bail!("handler failed");
            }
            Ok(())
        }
    }

    fn recorder(fail: bool) -> (Arc<Recorder>, mpsc::UnboundedReceiver<Delivery>) {
        let (seen, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { seen, fail }), rx)
    }

    fn consumer(broker: &MemoryBroker, tag: &str) -> Arc<Consumer> {
        let profile = ConnectionProfile::new(BackendKind::Amqp, "memory").with_retry(3, 1);
        let manager = ConnectionManager::new("c", &profile, Arc::new(broker.clone())).unwrap();
        Arc::new(
            Consumer::new(
                "orders",
                manager,
                RouteDescriptor::new("Q1", "E1", "orders"),
                ConsumerProfile::new(tag),
            )
            .unwrap(),
        )
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no delivery")
            .expect("handler dropped")
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_queue_is_required() {
        let broker = MemoryBroker::new();
        let profile = ConnectionProfile::new(BackendKind::Amqp, "memory");
        let manager = ConnectionManager::new("c", &profile, Arc::new(broker)).unwrap();
        let result = Consumer::new(
            "c",
            manager,
            RouteDescriptor::new("", "E1", "k"),
            ConsumerProfile::new("tag"),
        );
        assert!(matches!(result, Err(RelayError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_consume_requires_bind_and_tag() {
        let broker = MemoryBroker::new();
        let (handler, _rx) = recorder(false);

        let unbound = consumer(&broker, "tag");
        assert!(matches!(
            unbound.consume(handler.clone(), ConsumerOptions::default()),
            Err(RelayError::NotBound)
        ));

        let untagged = consumer(&broker, "");
        untagged.bind_queue(BindArguments::new()).await.unwrap();
        assert!(matches!(
            untagged.consume(handler, ConsumerOptions::default()),
            Err(RelayError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_is_idempotent() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, "tag");
        consumer.bind_queue(BindArguments::new()).await.unwrap();
        consumer.bind_queue(BindArguments::new()).await.unwrap();
        assert!(broker.is_bound("Q1", "E1", "orders"));
        assert!(consumer.is_bound());
    }

    #[tokio::test]
    async fn test_delivery_is_acked_once_after_handler() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, "tag");
        let (handler, mut rx) = recorder(false);
        consumer.bind_queue(BindArguments::new()).await.unwrap();
        let task = consumer.consume(handler, ConsumerOptions::default()).unwrap();

        eventually(|| broker.consumer_count("Q1") == 1).await;
        assert_eq!(broker.deliver("E1", "orders", b"hello"), 1);

        let delivery = next(&mut rx).await;
        assert_eq!(delivery.payload_text(), "hello");
        eventually(|| broker.acks().len() == 1).await;

        let acks = broker.acks();
        assert_eq!(acks[0].kind, AckKind::Ack);
        assert_eq!(acks[0].delivery_tag, delivery.tag.value);
        assert!(!acks[0].multiple);
        assert_eq!(broker.unacked_count(), 0);

        consumer.cancel().await;
        task.await.unwrap();
        assert_eq!(broker.acks().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_handler_is_still_acked() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, "tag");
        let (handler, mut rx) = recorder(true);
        consumer.bind_queue(BindArguments::new()).await.unwrap();
        let _task = consumer.consume(handler, ConsumerOptions::default()).unwrap();

        eventually(|| broker.consumer_count("Q1") == 1).await;
        broker.deliver("E1", "orders", b"boom");
        next(&mut rx).await;

        eventually(|| broker.acks().len() == 1).await;
        assert_eq!(broker.queue_depth("Q1"), 0);
        consumer.cancel().await;
    }

    #[tokio::test]
    async fn test_manual_ack_and_stale_tag() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, "tag");
        let (handler, mut rx) = recorder(false);
        consumer.bind_queue(BindArguments::new()).await.unwrap();
        let options = ConsumerOptions {
            ack_policy: AckPolicy::Manual,
            ..Default::default()
        };
        let _task = consumer.consume(handler, options).unwrap();

        eventually(|| broker.consumer_count("Q1") == 1).await;
        broker.deliver("E1", "orders", b"one");
        let first = next(&mut rx).await;
        assert!(broker.acks().is_empty());
        assert_eq!(broker.unacked_count(), 1);

        // The channel dies before the ack; the message comes back on a new
        // channel and the old tag is refused.
        broker.fire(ConnectionSignal::Shutdown);
        let again = next(&mut rx).await;
        assert!(again.redelivered);
        assert_ne!(again.tag.epoch, first.tag.epoch);

        assert!(matches!(
            consumer.ack(first.tag, false).await,
            Err(RelayError::StaleDeliveryTag { .. })
        ));
        consumer.reject(again.tag, false).await.unwrap();
        assert_eq!(broker.acks()[0].kind, AckKind::Reject { requeue: false });
        consumer.cancel().await;
    }

    #[tokio::test]
    async fn test_consume_error_is_skipped_and_loop_continues() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, "tag");
        let (handler, mut rx) = recorder(false);
        consumer.bind_queue(BindArguments::new()).await.unwrap();
        let _task = consumer.consume(handler, ConsumerOptions::default()).unwrap();

        eventually(|| broker.consumer_count("Q1") == 1).await;
        assert_eq!(broker.inject_consume_error("Q1"), 1);
        broker.deliver("E1", "orders", b"still here");

        let delivery = next(&mut rx).await;
        assert_eq!(delivery.payload_text(), "still here");
        eventually(|| broker.acks().len() == 1).await;

        let acks = broker.acks();
        assert_eq!(acks[0].kind, AckKind::Ack);
        assert_eq!(acks[0].delivery_tag, delivery.tag.value);
        assert!(consumer.is_consuming());
        assert_eq!(consumer.manager().epoch(), 1);

        consumer.cancel().await;
        assert_eq!(broker.acks().len(), 1);
    }

    #[tokio::test]
    async fn test_nack_with_requeue_redelivers_on_same_channel() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, "tag");
        let (handler, mut rx) = recorder(false);
        consumer.bind_queue(BindArguments::new()).await.unwrap();
        let options = ConsumerOptions {
            ack_policy: AckPolicy::Manual,
            ..Default::default()
        };
        let _task = consumer.consume(handler, options).unwrap();

        eventually(|| broker.consumer_count("Q1") == 1).await;
        broker.deliver("E1", "orders", b"retry me");
        let first = next(&mut rx).await;
        assert!(!first.redelivered);

        consumer.nack(first.tag, false, true).await.unwrap();
        let again = next(&mut rx).await;
        assert!(again.redelivered);
        assert_eq!(again.payload_text(), "retry me");
        assert_eq!(again.tag.epoch, first.tag.epoch);
        assert_ne!(again.tag.value, first.tag.value);
        assert_eq!(
            broker.acks()[0].kind,
            AckKind::Nack { requeue: true }
        );

        consumer.ack(again.tag, false).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth("Q1"), 0);
        consumer.cancel().await;
    }

    #[tokio::test]
    async fn test_unsubscribed_routing_key_is_acked_without_dispatch() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        registry.add_subscription("wanted");
        let profile = ConnectionProfile::new(BackendKind::Amqp, "memory");
        let manager = ConnectionManager::new("c", &profile, Arc::new(broker.clone())).unwrap();
        let consumer = Arc::new(
            Consumer::new(
                "hub",
                manager,
                RouteDescriptor::new("Q1", "E1", ""),
                ConsumerProfile::new("hub"),
            )
            .unwrap()
            .with_registry(registry.clone()),
        );
        consumer.bind_routing_key("wanted", BindArguments::new()).await.unwrap();
        consumer.bind_routing_key("stale", BindArguments::new()).await.unwrap();
        let (handler, mut rx) = recorder(false);
        let _task = consumer.consume(handler, ConsumerOptions::default()).unwrap();

        eventually(|| broker.consumer_count("Q1") == 1).await;
        broker.deliver("E1", "stale", b"ignored");
        broker.deliver("E1", "wanted", b"kept");

        let delivery = next(&mut rx).await;
        assert_eq!(delivery.routing_key, "wanted");
        eventually(|| broker.acks().len() == 2).await;
        assert!(rx.try_recv().is_err());
        consumer.cancel().await;
    }

    #[tokio::test]
    async fn test_consumer_survives_reconnect() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, "tag");
        let (handler, mut rx) = recorder(false);
        consumer.bind_queue(BindArguments::new()).await.unwrap();
        let _task = consumer.consume(handler, ConsumerOptions::default()).unwrap();
        eventually(|| broker.consumer_count("Q1") == 1).await;

        broker.fire(ConnectionSignal::Shutdown);
        eventually(|| consumer.manager().epoch() == 2 && broker.consumer_count("Q1") == 1).await;

        broker.deliver("E1", "orders", b"after");
        assert_eq!(next(&mut rx).await.payload_text(), "after");
        consumer.cancel().await;
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, "tag");
        let (handler, _rx) = recorder(false);
        consumer.bind_queue(BindArguments::new()).await.unwrap();
        let task = consumer.consume(handler.clone(), ConsumerOptions::default()).unwrap();
        eventually(|| broker.consumer_count("Q1") == 1).await;

        consumer.cancel().await;
        consumer.cancel().await;
        task.await.unwrap();
        assert!(!consumer.is_consuming());
        assert_eq!(broker.consumer_count("Q1"), 0);

        // Consuming can start again after a cancel.
        let _task = consumer.consume(handler, ConsumerOptions::default()).unwrap();
        eventually(|| broker.consumer_count("Q1") == 1).await;
        consumer.cancel().await;
    }
}
