//! Exchange publisher.
//!
//! Publishes are always `mandatory`, so the broker reports unroutable
//! messages back instead of dropping them. When confirms are requested the
//! channel is put in confirm mode right after it is opened, before the
//! first publish on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::broker::BindArguments;
use crate::connection::{ChannelLease, ChannelSlot, ConnectionManager};
use crate::error::{RelayError, Result};
use crate::types::{MessageProperties, OutboundMessage, PublishOutcome, ReturnedMessage, RouteDescriptor};

/// Broker verdicts for a single publish.
///
/// At most one method is called per publish.
pub trait PublishCallbacks: Send + Sync {
    /// The message could not be routed.
    fn on_return(&self, _returned: &ReturnedMessage) {}

    /// The broker confirmed publish number `sequence`.
    fn on_ack(&self, _sequence: u64) {}

    /// The broker refused publish number `sequence`.
    fn on_nack(&self, _sequence: u64) {}
}

/// Per-call publish options.
#[derive(Clone, Default)]
pub struct PublishOptions {
    /// Defaults to [`MessageProperties::persistent`]
    pub properties: Option<MessageProperties>,
    pub callbacks: Option<Arc<dyn PublishCallbacks>>,
}

impl PublishOptions {
    pub fn with_callbacks(callbacks: Arc<dyn PublishCallbacks>) -> Self {
        Self {
            properties: None,
            callbacks: Some(callbacks),
        }
    }
}

/// Publisher sending to one exchange.
pub struct Publisher {
    name: String,
    route: RouteDescriptor,
    confirm_publish: bool,
    slot: ChannelSlot,
    sequence: AtomicU64,
}

impl Publisher {
    pub fn new(
        name: &str,
        manager: Arc<ConnectionManager>,
        route: RouteDescriptor,
        confirm_publish: bool,
    ) -> Result<Self> {
        if route.exchange.trim().is_empty() {
            return Err(RelayError::InvalidConfiguration(format!(
                "publisher '{}' has no exchange",
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            route,
            confirm_publish,
            slot: ChannelSlot::new(manager),
            sequence: AtomicU64::new(0),
        })
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

    fn check_disposed(&self) -> Result<()> {
        if self.manager().is_disposed() {
            Err(RelayError::Disposed)
        } else {
            Ok(())
        }
    }

    async fn lease(&self) -> Result<ChannelLease<'_>> {
        let lease = self.slot.lease().await?;
        if lease.is_fresh() && self.confirm_publish {
            let selected = lease.channel().confirm_select().await;
            if let Err(e) = selected {
                drop(lease);
                self.slot.close().await;
                return Err(e.into());
            }
            debug!(publisher = %self.name, channel_id = lease.handle().id(), "Confirm mode enabled");
        }
        Ok(lease)
    }

    /// Bind the configured queue so that publishes are routable.
    pub async fn bind_queue(&self, arguments: BindArguments) -> Result<()> {
        self.check_disposed()?;
        if self.route.queue.trim().is_empty() {
            return Ok(());
        }
        let lease = self.lease().await?;
        lease.channel().bind_queue(&self.route, &arguments).await?;
        debug!(
            publisher = %self.name,
            queue = %self.route.queue,
            exchange = %self.route.exchange,
            routing_key = %self.route.routing_key,
            "Queue bound"
        );
        Ok(())
    }

    /// Publish with the configured routing key.
    pub async fn publish(&self, payload: &[u8], options: PublishOptions) -> Result<PublishOutcome> {
        let routing_key = self.route.routing_key.clone();
        self.publish_with_key(&routing_key, payload, options).await
    }

    /// Publish with an explicit routing key.
    ///
    /// Not retried here; see [`crate::retry::RetryPolicy::exponential`].
    #[instrument(skip(self, payload, options), fields(publisher = %self.name))]
    pub async fn publish_with_key(
        &self,
        routing_key: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<PublishOutcome> {
        self.check_disposed()?;
        let lease = self.lease().await?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let properties = options.properties.unwrap_or_else(MessageProperties::persistent);
        let outcome = lease
            .channel()
            .publish(OutboundMessage {
                exchange: &self.route.exchange,
                routing_key,
                mandatory: true,
                properties,
                payload,
            })
            .await?;
        drop(lease);

        match &outcome {
            PublishOutcome::Acked => {
                debug!(sequence, bytes = payload.len(), "Publish confirmed");
                if let Some(callbacks) = &options.callbacks {
                    callbacks.on_ack(sequence);
                }
            }
            PublishOutcome::Nacked => {
                warn!(sequence, exchange = %self.route.exchange, routing_key, "Broker refused publish");
                if let Some(callbacks) = &options.callbacks {
                    callbacks.on_nack(sequence);
                }
            }
            PublishOutcome::Returned(returned) => {
                warn!(
                    sequence,
                    reply_code = returned.reply_code,
                    reply_text = %returned.reply_text,
                    exchange = %returned.exchange,
                    routing_key = %returned.routing_key,
                    "Broker returned unroutable message"
                );
                if let Some(callbacks) = &options.callbacks {
                    callbacks.on_return(returned);
                }
            }
            PublishOutcome::Unconfirmed => {
                debug!(sequence, bytes = payload.len(), "Published without confirmation");
            }
        }

        Ok(outcome)
    }

    pub async fn close(&self) {
        self.slot.close().await;
        info!(publisher = %self.name, "Publisher closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::types::{BackendKind, ConnectionProfile};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Verdicts {
        returns: Mutex<Vec<ReturnedMessage>>,
        acks: Mutex<Vec<u64>>,
        nacks: Mutex<Vec<u64>>,
    }

    impl PublishCallbacks for Verdicts {
        fn on_return(&self, returned: &ReturnedMessage) {
            self.returns.lock().unwrap().push(returned.clone());
        }

        fn on_ack(&self, sequence: u64) {
            self.acks.lock().unwrap().push(sequence);
        }

        fn on_nack(&self, sequence: u64) {
            self.nacks.lock().unwrap().push(sequence);
        }
    }

    fn publisher(broker: &MemoryBroker, confirm: bool) -> Publisher {
        let profile = ConnectionProfile::new(BackendKind::Amqp, "memory").with_retry(1, 1);
        let manager = ConnectionManager::new("p", &profile, Arc::new(broker.clone())).unwrap();
        Publisher::new("outbound", manager, RouteDescriptor::new("Q1", "E1", "orders"), confirm).unwrap()
    }

    #[test]
    fn test_exchange_is_required() {
        let profile = ConnectionProfile::new(BackendKind::Amqp, "memory");
        let manager = ConnectionManager::new("p", &profile, Arc::new(MemoryBroker::new())).unwrap();
        assert!(matches!(
            Publisher::new("p", manager, RouteDescriptor::new("Q1", "", "k"), false),
            Err(RelayError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_unroutable_publish_calls_on_return_once() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker, true);
        let verdicts = Arc::new(Verdicts::default());

        let outcome = publisher
            .publish(b"lost", PublishOptions::with_callbacks(verdicts.clone()))
            .await
            .unwrap();

        assert!(matches!(outcome, PublishOutcome::Returned(_)));
        assert_eq!(verdicts.returns.lock().unwrap().len(), 1);
        assert!(verdicts.acks.lock().unwrap().is_empty());
        assert!(verdicts.nacks.lock().unwrap().is_empty());
        assert!(broker.published()[0].mandatory);
    }

    #[tokio::test]
    async fn test_confirmed_publish_is_persistent_and_acked() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker, true);
        publisher.bind_queue(BindArguments::new()).await.unwrap();
        let verdicts = Arc::new(Verdicts::default());

        for _ in 0..3 {
            let outcome = publisher
                .publish(b"payload", PublishOptions::with_callbacks(verdicts.clone()))
                .await
                .unwrap();
            assert_eq!(outcome, PublishOutcome::Acked);
        }

        // One callback per publish, nothing accumulates.
        assert_eq!(*verdicts.acks.lock().unwrap(), vec![1, 2, 3]);
        assert!(verdicts.returns.lock().unwrap().is_empty());
        assert_eq!(broker.queue_depth("Q1"), 3);

        let record = &broker.published()[0];
        assert!(record.properties.is_persistent());
        assert!(record.properties.message_id.is_some());
    }

    #[tokio::test]
    async fn test_nack_and_unconfirmed() {
        let broker = MemoryBroker::new();
        broker.bind("Q1", "E1", "orders");
        broker.set_nack_publishes(true);
        let verdicts = Arc::new(Verdicts::default());

        let confirming = publisher(&broker, true);
        let outcome = confirming
            .publish(b"x", PublishOptions::with_callbacks(verdicts.clone()))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Nacked);
        assert_eq!(*verdicts.nacks.lock().unwrap(), vec![1]);

        let plain = publisher(&broker, false);
        let outcome = plain
            .publish(b"x", PublishOptions::with_callbacks(verdicts.clone()))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Unconfirmed);
        assert!(verdicts.acks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_properties_are_kept() {
        let broker = MemoryBroker::new();
        broker.bind("Q1", "E1", "orders");
        let publisher = publisher(&broker, false);
        let properties = MessageProperties::default().with_content_type("application/xml");

        publisher
            .publish(
                b"<a/>",
                PublishOptions {
                    properties: Some(properties.clone()),
                    callbacks: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(broker.published()[0].properties, properties);
    }

    #[tokio::test]
    async fn test_socket_failure_is_transient() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(1);
        let publisher = publisher(&broker, false);

        let err = publisher.publish(b"x", PublishOptions::default()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
