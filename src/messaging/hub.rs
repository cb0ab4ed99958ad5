//! Name-based event hub.
//!
//! One queue, one exchange, one routing key per event name. Subscribing to
//! a name binds its routing key and starts consuming on the first
//! subscription; removing the last subscription unbinds and stops
//! consuming.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::consumer::{Consumer, ConsumerOptions, DeliveryHandler};
use super::publisher::{PublishCallbacks, PublishOptions, Publisher};
use crate::broker::BindArguments;
use crate::connection::ConnectionManager;
use crate::error::{RelayError, Result};
use crate::retry::RetryPolicy;
use crate::subscriptions::SubscriptionRegistry;
use crate::types::{ConsumerProfile, Delivery, PublishOutcome, RouteDescriptor};

/// Base delay of the publish retry policy.
const PUBLISH_RETRY_BASE: Duration = Duration::from_secs(1);

type HandlerMap = Arc<Mutex<HashMap<String, Arc<dyn DeliveryHandler>>>>;

fn handlers(map: &HandlerMap) -> MutexGuard<'_, HashMap<String, Arc<dyn DeliveryHandler>>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes deliveries to the handler registered for their routing key.
struct Dispatcher {
    handlers: HandlerMap,
}

#[async_trait]
impl DeliveryHandler for Dispatcher {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let handler = handlers(&self.handlers).get(&delivery.routing_key).cloned();
        match handler {
            Some(handler) => handler.handle(delivery).await,
            None => anyhow::bail!("no handler for event '{}'", delivery.routing_key),
        }
    }
}

/// Subscribe, unsubscribe and publish events by name.
pub struct EventHub {
    manager: Arc<ConnectionManager>,
    consumer: Arc<Consumer>,
    publisher: Publisher,
    registry: Arc<SubscriptionRegistry>,
    handlers: HandlerMap,
    lifecycle: Arc<tokio::sync::Mutex<()>>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl EventHub {
    /// Create the hub and start listening for subscription removals.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        name: &str,
        manager: Arc<ConnectionManager>,
        queue: &str,
        exchange: &str,
        consumer_profile: ConsumerProfile,
    ) -> Result<Self> {
        let registry = Arc::new(SubscriptionRegistry::new());
        let shutdown = CancellationToken::new();
        let route = RouteDescriptor::new(queue, exchange, "");

        let consumer = Arc::new(
            Consumer::new(name, manager.clone(), route.clone(), consumer_profile)?
                .with_registry(registry.clone())
                .with_shutdown(shutdown.child_token()),
        );
        let publisher = Publisher::new(name, manager.clone(), route, true)?;
        let policy = RetryPolicy::exponential(manager.retry_count(), PUBLISH_RETRY_BASE);

        let hub = Self {
            manager,
            consumer,
            publisher,
            registry,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            lifecycle: Arc::new(tokio::sync::Mutex::new(())),
            policy,
            shutdown,
            disposed: AtomicBool::new(false),
        };
        hub.watch_removals();
        Ok(hub)
    }

    /// Use a different publish retry policy.
    pub fn with_publish_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn is_consuming(&self) -> bool {
        self.consumer.is_consuming()
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(RelayError::Disposed)
        } else {
            Ok(())
        }
    }

    fn watch_removals(&self) {
        let mut removals = self.registry.subscribe_removals();
        let registry = self.registry.clone();
        let consumer = self.consumer.clone();
        let handler_map = self.handlers.clone();
        let lifecycle = self.lifecycle.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    removed = removals.recv() => match removed {
                        Ok(name) => name,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Missed subscription removal notifications");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };

                let _guard = lifecycle.lock().await;
                if registry.has_subscriptions_for_event(&name) {
                    continue;
                }
                handlers(&handler_map).remove(&name);
                if let Err(e) = consumer.unbind_routing_key(&name).await {
                    error!(event = %name, error = %e, "Could not unbind removed event");
                }
                if registry.is_empty() {
                    consumer.cancel().await;
                }
            }
        });
    }

    /// Subscribe `handler` to events called `name`.
    pub async fn subscribe(&self, name: &str, handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        self.check_disposed()?;
        if name.trim().is_empty() {
            return Err(RelayError::InvalidArgument(
                "event name must not be empty".to_string(),
            ));
        }

        let _guard = self.lifecycle.lock().await;
        handlers(&self.handlers).insert(name.to_string(), handler);
        if self.registry.add_subscription(name) {
            if let Err(e) = self.consumer.bind_routing_key(name, BindArguments::new()).await {
                handlers(&self.handlers).remove(name);
                self.registry.remove_subscription(name);
                return Err(e);
            }
        }

        if !self.consumer.is_consuming() {
            let dispatcher = Arc::new(Dispatcher {
                handlers: self.handlers.clone(),
            });
            self.consumer.consume(dispatcher, ConsumerOptions::default())?;
        }

        info!(event = name, subscriptions = self.registry.len(), "Subscribed");
        Ok(())
    }

    /// Remove the subscription for `name`. Returns whether it existed.
    pub fn unsubscribe(&self, name: &str) -> bool {
        let removed = self.registry.remove_subscription(name);
        if removed {
            info!(event = name, "Unsubscribed");
        }
        removed
    }

    /// Publish `payload` as event `name`, retrying transient failures with
    /// exponential backoff.
    pub async fn publish(
        &self,
        name: &str,
        payload: &[u8],
        callbacks: Option<Arc<dyn PublishCallbacks>>,
    ) -> Result<PublishOutcome> {
        self.check_disposed()?;
        let options = PublishOptions {
            properties: None,
            callbacks,
        };
        self.policy
            .execute("publish", || {
                self.publisher
                    .publish_with_key(name, payload, options.clone())
            })
            .await
    }

    /// Stop consuming, forget subscriptions and dispose the connection.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.consumer.close().await;
        self.publisher.close().await;
        self.registry.clear();
        handlers(&self.handlers).clear();
        self.manager.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::types::{BackendKind, ConnectionProfile};
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl DeliveryHandler for Forward {
        async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
            let _ = self.0.send(delivery.payload_text());
            Ok(())
        }
    }

    fn hub(broker: &MemoryBroker) -> EventHub {
        let profile = ConnectionProfile::new(BackendKind::Amqp, "memory").with_retry(2, 1);
        let manager = ConnectionManager::new("hub", &profile, Arc::new(broker.clone())).unwrap();
        EventHub::new("hub", manager, "Q1", "E1", ConsumerProfile::new("hub")).unwrap()
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

    #[tokio::test]
    async fn test_subscribe_binds_and_dispatches_by_name() {
        let broker = MemoryBroker::new();
        let hub = hub(&broker);
        let (orders_tx, mut orders) = mpsc::unbounded_channel();
        let (invoices_tx, mut invoices) = mpsc::unbounded_channel();

        hub.subscribe("orders", Arc::new(Forward(orders_tx))).await.unwrap();
        hub.subscribe("invoices", Arc::new(Forward(invoices_tx))).await.unwrap();
        assert!(broker.is_bound("Q1", "E1", "orders"));
        assert!(broker.is_bound("Q1", "E1", "invoices"));
        assert!(hub.is_consuming());

        let outcome = hub.publish("orders", b"o-1", None).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Acked);
        hub.publish("invoices", b"i-1", None).await.unwrap();

        assert_eq!(orders.recv().await.unwrap(), "o-1");
        assert_eq!(invoices.recv().await.unwrap(), "i-1");
        hub.dispose().await;
    }

    #[tokio::test]
    async fn test_last_unsubscribe_unbinds_and_stops_consuming() {
        let broker = MemoryBroker::new();
        let hub = hub(&broker);
        let (tx, _rx) = mpsc::unbounded_channel();

        hub.subscribe("a", Arc::new(Forward(tx.clone()))).await.unwrap();
        hub.subscribe("b", Arc::new(Forward(tx))).await.unwrap();

        assert!(hub.unsubscribe("a"));
        assert!(!hub.unsubscribe("a"));
        eventually(|| !broker.is_bound("Q1", "E1", "a")).await;
        assert!(hub.is_consuming());

        assert!(hub.unsubscribe("b"));
        eventually(|| !hub.is_consuming()).await;
        assert!(!broker.is_bound("Q1", "E1", "b"));
        hub.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_retries_transient_failures() {
        let broker = MemoryBroker::new();
        broker.bind("Q1", "E1", "orders");
        broker.fail_next_publishes(2);
        let hub = hub(&broker);

        let outcome = hub.publish("orders", b"x", None).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Acked);
        assert_eq!(broker.queue_depth("Q1"), 1);
    }

    #[tokio::test]
    async fn test_operations_after_dispose() {
        let broker = MemoryBroker::new();
        let hub = hub(&broker);
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.subscribe("a", Arc::new(Forward(tx.clone()))).await.unwrap();

        hub.dispose().await;
        hub.dispose().await;

        assert!(hub.registry().is_empty());
        assert_eq!(broker.open_connections(), 0);
        assert!(matches!(
            hub.subscribe("a", Arc::new(Forward(tx))).await,
            Err(RelayError::Disposed)
        ));
        assert!(matches!(
            hub.publish("a", b"x", None).await,
            Err(RelayError::Disposed)
        ));
    }
}
