//! Builds workers from settings and runs them until shutdown.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::scheduler::PublishScheduler;
use super::worker::{ConsumerWorker, PublisherWorker, WorkerStatus};
use crate::broker::BrokerBackend;
use crate::error::{RelayError, Result};
use crate::types::{BackendKind, Settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Health of every worker.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub workers: Vec<WorkerStatus>,
}

/// Owner of every consumer and publisher worker.
pub struct Supervisor {
    consumers: Vec<Arc<ConsumerWorker>>,
    publishers: Vec<Arc<PublisherWorker>>,
}

impl Supervisor {
    /// Build the workers of every enabled backend.
    ///
    /// `resolve` supplies the backend implementation for a kind; a kind
    /// without one is a configuration error when it has workers.
    pub fn from_settings<R>(settings: &Settings, resolve: R) -> Result<Self>
    where
        R: Fn(BackendKind) -> Option<Arc<dyn BrokerBackend>>,
    {
        let mut consumers = Vec::new();
        let mut publishers = Vec::new();

        for (kind, section) in settings.backends() {
            if !section.enabled {
                info!(backend = %kind, "Backend disabled, skipping");
                continue;
            }

            let consumer_definitions = section.consumer_definitions(kind)?;
            let publisher_definitions = section.publisher_definitions(kind)?;
            if consumer_definitions.is_empty() && publisher_definitions.is_empty() {
                info!(backend = %kind, "Backend has no consumers or publishers");
                continue;
            }

            let backend = resolve(kind).ok_or_else(|| {
                RelayError::InvalidConfiguration(format!(
                    "{} backend is not available in this build",
                    kind
                ))
            })?;
            let interval = Duration::from_millis(section.publishers.processing_interval_ms);

            for definition in consumer_definitions {
                consumers.push(Arc::new(ConsumerWorker::new(definition, backend.clone())?));
            }
            for definition in publisher_definitions {
                publishers.push(Arc::new(PublisherWorker::new(
                    definition,
                    backend.clone(),
                    PublishScheduler::new(interval),
                )?));
            }
        }

        info!(
            consumers = consumers.len(),
            publishers = publishers.len(),
            "Workers configured"
        );
        Ok(Self {
            consumers,
            publishers,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.consumers.len() + self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.worker_count() == 0
    }

    pub fn health(&self) -> HealthReport {
        let workers: Vec<WorkerStatus> = self
            .consumers
            .iter()
            .map(|w| w.status())
            .chain(self.publishers.iter().map(|w| w.status()))
            .collect();
        let status = if workers.iter().all(|w| w.healthy) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            workers,
        }
    }

    /// Run every worker in parallel until `cancel` fires and all of them
    /// have disposed their connections.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();
        for worker in &self.consumers {
            tasks.spawn(worker.clone().run(cancel.child_token()));
        }
        for worker in &self.publishers {
            tasks.spawn(worker.clone().run(cancel.child_token()));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("All workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::types::{BrokerSettings, ConsumerSettings, PublisherSettings};
    use tempfile::TempDir;

    fn settings(root: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        let rabbit = &mut settings.services.rabbitmq;
        rabbit.enabled = true;
        rabbit.brokers.insert(
            "main".to_string(),
            BrokerSettings {
                host: "memory".to_string(),
                retry_count: 1,
                wait_and_retry_seconds: 1,
                ..Default::default()
            },
        );
        rabbit.consumers.insert(
            "orders".to_string(),
            ConsumerSettings {
                broker: "main".to_string(),
                queue: "Q1".to_string(),
                exchange: "E1".to_string(),
                routing_key: "orders".to_string(),
                file_directory: Some(root.join("inbound")),
                ..Default::default()
            },
        );
        rabbit.publishers.processing_interval_ms = 100;
        rabbit.publishers.items.insert(
            "outbound".to_string(),
            PublisherSettings {
                broker: "main".to_string(),
                queue: "Q1".to_string(),
                exchange: "E1".to_string(),
                routing_key: "orders".to_string(),
                file_directory: root.join("outbound"),
                completion_directory: root.join("done"),
                ..Default::default()
            },
        );
        settings
    }

    #[test]
    fn test_builds_workers_for_enabled_backends() {
        let root = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let supervisor = Supervisor::from_settings(&settings(root.path()), |_| {
            Some(Arc::new(broker.clone()) as Arc<dyn BrokerBackend>)
        })
        .unwrap();

        assert_eq!(supervisor.worker_count(), 2);
        let health = supervisor.health();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.workers.len(), 2);
    }

    #[test]
    fn test_missing_backend_is_a_configuration_error() {
        let root = TempDir::new().unwrap();
        let result = Supervisor::from_settings(&settings(root.path()), |_| None);
        assert!(matches!(result, Err(RelayError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_disabled_backend_is_skipped() {
        let root = TempDir::new().unwrap();
        let mut settings = settings(root.path());
        settings.services.rabbitmq.enabled = false;
        let supervisor = Supervisor::from_settings(&settings, |_| None).unwrap();
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_relays_files_through_the_broker_until_cancelled() {
        let root = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let supervisor = Arc::new(
            Supervisor::from_settings(&settings(root.path()), |_| {
                Some(Arc::new(broker.clone()) as Arc<dyn BrokerBackend>)
            })
            .unwrap(),
        );
        let outbound = root.path().join("outbound");
        std::fs::create_dir_all(&outbound).unwrap();
        std::fs::write(outbound.join("order.xml"), "<order/>").unwrap();

        let cancel = CancellationToken::new();
        let task = {
            let supervisor = supervisor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { supervisor.run(cancel).await })
        };

        let inbound = root.path().join("inbound");
        let mut written = Vec::new();
        for _ in 0..400 {
            written = std::fs::read_dir(&inbound)
                .map(|entries| entries.map(|e| e.unwrap().path()).collect())
                .unwrap_or_default();
            if !written.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(written.len(), 1);
        assert_eq!(std::fs::read_to_string(&written[0]).unwrap(), "<order/>");

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(broker.open_connections(), 0);
    }
}
