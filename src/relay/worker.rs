//! Consumer and publisher workers.
//!
//! Each worker owns one connection manager and one channel. Workers never
//! crash the process: a faulted connection only marks the worker unhealthy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::dir_scan::DirectoryScanner;
use super::file_sink::FileSink;
use super::scheduler::PublishScheduler;
use crate::broker::{BindArguments, BrokerBackend};
use crate::connection::ConnectionManager;
use crate::error::{RelayError, Result};
use crate::messaging::{Consumer, ConsumerOptions, DeliveryHandler, PublishOptions, Publisher};
use crate::retry::RetryPolicy;
use crate::types::{
    BackendKind, ConnectionState, ConsumerDefinition, Delivery, PublishOutcome, PublisherDefinition,
};

/// Base delay of the publish retry policy.
const PUBLISH_RETRY_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Consumer,
    Publisher,
}

/// Point-in-time health of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub role: WorkerRole,
    pub backend: BackendKind,
    pub state: ConnectionState,
    pub healthy: bool,
    /// Messages written (consumer) or files published (publisher)
    pub processed: u64,
}

fn status(
    name: &str,
    role: WorkerRole,
    backend: BackendKind,
    manager: &ConnectionManager,
    processed: u64,
) -> WorkerStatus {
    WorkerStatus {
        name: name.to_string(),
        role,
        backend,
        state: manager.state(),
        healthy: manager.is_healthy(),
        processed,
    }
}

/// Materializes one queue into a directory.
pub struct ConsumerWorker {
    definition: ConsumerDefinition,
    consumer: Arc<Consumer>,
    sink: Arc<CountingSink>,
}

/// File sink that counts written messages.
struct CountingSink {
    sink: FileSink,
    written: AtomicU64,
}

#[async_trait]
impl DeliveryHandler for CountingSink {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        self.sink.handle(delivery).await?;
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl ConsumerWorker {
    pub fn new(definition: ConsumerDefinition, backend: Arc<dyn BrokerBackend>) -> Result<Self> {
        let manager = ConnectionManager::new(&definition.name, &definition.connection, backend)?;
        let consumer = Consumer::new(
            &definition.name,
            manager,
            definition.route.clone(),
            definition.profile.clone(),
        )?;
        let sink = FileSink::from_profile(&definition.profile);

        Ok(Self {
            definition,
            consumer: Arc::new(consumer),
            sink: Arc::new(CountingSink {
                sink,
                written: AtomicU64::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        self.consumer.manager()
    }

    pub fn status(&self) -> WorkerStatus {
        status(
            &self.definition.name,
            WorkerRole::Consumer,
            self.definition.connection.backend,
            self.manager(),
            self.sink.written.load(Ordering::Relaxed),
        )
    }

    /// Connect, bind, consume until `cancel` fires, then dispose.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let manager = self.manager().clone();
        info!(
            worker = %self.name(),
            queue = %self.definition.route.queue,
            directory = %self.sink.sink.directory().display(),
            "Starting consumer worker"
        );

        if !manager.connect().await {
            warn!(worker = %self.name(), "Consumer worker started without a connection");
        }

        if self.bind(&cancel).await {
            match self.consumer.consume(self.sink.clone(), ConsumerOptions::default()) {
                Ok(task) => {
                    cancel.cancelled().await;
                    self.consumer.close().await;
                    if let Err(e) = task.await {
                        error!(worker = %self.name(), error = %e, "Delivery loop panicked");
                    }
                }
                Err(e) => error!(worker = %self.name(), error = %e, "Could not start consuming"),
            }
        }

        manager.dispose().await;
        info!(worker = %self.name(), "Consumer worker stopped");
    }

    async fn bind(&self, cancel: &CancellationToken) -> bool {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return false,
                result = self.consumer.bind_queue(BindArguments::new()) => result,
            };
            match result {
                Ok(()) => return true,
                Err(RelayError::Disposed) => return false,
                Err(e) => {
                    error!(worker = %self.name(), error = %e, "Could not bind queue");
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(self.manager().retry_wait()) => {}
                    }
                }
            }
        }
    }
}

/// Publishes the files of one directory on a schedule.
pub struct PublisherWorker {
    definition: PublisherDefinition,
    publisher: Publisher,
    scanner: DirectoryScanner,
    scheduler: PublishScheduler,
    policy: RetryPolicy,
    published: AtomicU64,
}

impl PublisherWorker {
    pub fn new(
        definition: PublisherDefinition,
        backend: Arc<dyn BrokerBackend>,
        scheduler: PublishScheduler,
    ) -> Result<Self> {
        let manager = ConnectionManager::new(&definition.name, &definition.connection, backend)?;
        let policy = RetryPolicy::exponential(manager.retry_count(), PUBLISH_RETRY_BASE);
        let publisher = Publisher::new(
            &definition.name,
            manager,
            definition.route.clone(),
            definition.profile.confirm_publish,
        )?;
        let scanner = DirectoryScanner::new(&definition.profile);

        Ok(Self {
            definition,
            publisher,
            scanner,
            scheduler,
            policy,
            published: AtomicU64::new(0),
        })
    }

    /// Use a different publish retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        self.publisher.manager()
    }

    pub fn status(&self) -> WorkerStatus {
        status(
            &self.definition.name,
            WorkerRole::Publisher,
            self.definition.connection.backend,
            self.manager(),
            self.published.load(Ordering::Relaxed),
        )
    }

    /// Scan and publish on every tick until `cancel` fires, then dispose.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let manager = self.manager().clone();
        info!(
            worker = %self.name(),
            directory = %self.scanner.source().display(),
            interval_ms = self.scheduler.period().as_millis() as u64,
            "Starting publisher worker"
        );

        if !manager.connect().await {
            warn!(worker = %self.name(), "Publisher worker started without a connection");
        }

        self.scheduler
            .run(&cancel, || async {
                self.publish_pending().await;
            })
            .await;

        self.publisher.close().await;
        manager.dispose().await;
        info!(worker = %self.name(), "Publisher worker stopped");
    }

    /// Publish every pending file once. Returns the number of files moved
    /// to the completion directory.
    pub async fn publish_pending(&self) -> usize {
        let files = match self.scanner.scan().await {
            Ok(files) => files,
            Err(e) => {
                error!(worker = %self.name(), error = %e, "Could not scan source directory");
                return 0;
            }
        };
        if files.is_empty() {
            return 0;
        }

        if let Err(e) = self.publisher.bind_queue(BindArguments::new()).await {
            error!(worker = %self.name(), error = %e, "Could not bind queue, skipping scan");
            return 0;
        }

        let mut completed = 0;
        for path in files {
            let payload = match tokio::fs::read(&path).await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(worker = %self.name(), path = %path.display(), error = %e, "Could not read file");
                    continue;
                }
            };

            let result = self
                .policy
                .execute("publish", || {
                    self.publisher.publish(&payload, PublishOptions::default())
                })
                .await;

            match result {
                Ok(outcome) if outcome.is_delivered() => match self.scanner.complete(&path).await {
                    Ok(target) => {
                        completed += 1;
                        self.published.fetch_add(1, Ordering::Relaxed);
                        info!(
                            worker = %self.name(),
                            path = %path.display(),
                            completed = %target.display(),
                            bytes = payload.len(),
                            "File published"
                        );
                    }
                    Err(e) => {
                        error!(worker = %self.name(), path = %path.display(), error = %e, "Published file could not be moved");
                    }
                },
                Ok(PublishOutcome::Returned(returned)) => {
                    warn!(
                        worker = %self.name(),
                        path = %path.display(),
                        reply_text = %returned.reply_text,
                        "File was not routable, leaving it in place"
                    );
                }
                Ok(_) => {
                    warn!(worker = %self.name(), path = %path.display(), "Broker refused file, leaving it in place");
                }
                Err(e) => {
                    error!(
                        worker = %self.name(),
                        path = %path.display(),
                        error = %e,
                        "Publish failed, remaining files wait for the next scan"
                    );
                    break;
                }
            }
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{AckKind, MemoryBroker};
    use crate::types::{ConnectionProfile, ConsumerProfile, PublisherProfile, RouteDescriptor};
    use std::path::Path;
    use tempfile::TempDir;

    fn connection() -> ConnectionProfile {
        ConnectionProfile::new(BackendKind::Amqp, "memory").with_retry(2, 1)
    }

    fn publisher_definition(root: &Path) -> PublisherDefinition {
        PublisherDefinition {
            name: "outbound".to_string(),
            connection: connection(),
            route: RouteDescriptor::new("Q1", "E1", "orders"),
            profile: PublisherProfile {
                confirm_publish: true,
                file_directory: root.join("outbound"),
                file_extension: ".xml".to_string(),
                completion_directory: root.join("done"),
            },
        }
    }

    fn files_in(dir: &Path) -> Vec<std::path::PathBuf> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_round_trip_after_one_interval() {
        let root = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let worker = Arc::new(
            PublisherWorker::new(
                publisher_definition(root.path()),
                Arc::new(broker.clone()),
                PublishScheduler::new(Duration::from_secs(5)),
            )
            .unwrap(),
        );
        let source = root.path().join("outbound");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("order.xml"), b"<order/>").unwrap();
        std::fs::write(source.join("notes.txt"), b"skip").unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(worker.clone().run(cancel.clone()));

        // Real file I/O runs on the blocking pool; give it time to finish.
        tokio::time::sleep(Duration::from_secs(6)).await;
        for _ in 0..200 {
            if worker.status().processed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(!source.join("order.xml").exists());
        assert!(source.join("notes.txt").exists());
        let done = files_in(&root.path().join("done"));
        assert_eq!(done.len(), 1);
        assert!(done[0]
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("order.xml_"));
        assert_eq!(std::fs::read(&done[0]).unwrap(), b"<order/>");
        assert_eq!(broker.queue_depth("Q1"), 1);
        assert_eq!(broker.published()[0].payload, b"<order/>");

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_unroutable_file_stays_in_place() {
        let root = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let mut definition = publisher_definition(root.path());
        definition.route.queue = String::new();
        let worker = PublisherWorker::new(
            definition,
            Arc::new(broker.clone()),
            PublishScheduler::new(Duration::from_secs(5)),
        )
        .unwrap();
        let source = root.path().join("outbound");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("order.xml"), b"<order/>").unwrap();

        assert_eq!(worker.publish_pending().await, 0);
        assert!(source.join("order.xml").exists());
        assert!(matches!(
            broker.published()[0].outcome,
            PublishOutcome::Returned(_)
        ));
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_files() {
        let root = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(10);
        let worker = PublisherWorker::new(
            publisher_definition(root.path()),
            Arc::new(broker.clone()),
            PublishScheduler::new(Duration::from_secs(5)),
        )
        .unwrap()
        .with_policy(RetryPolicy::exponential(1, Duration::from_millis(1)));
        let source = root.path().join("outbound");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("a.xml"), b"a").unwrap();
        std::fs::write(source.join("b.xml"), b"b").unwrap();

        assert_eq!(worker.publish_pending().await, 0);
        assert_eq!(files_in(&source).len(), 2);
        assert!(files_in(&root.path().join("done")).is_empty());
    }

    #[tokio::test]
    async fn test_consumer_worker_end_to_end() {
        let root = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let output = root.path().join("inbound");
        let mut profile = ConsumerProfile::new("relay-orders");
        profile.file_directory = Some(output.clone());
        profile.file_extension = Some("xml".to_string());
        let definition = ConsumerDefinition {
            name: "orders".to_string(),
            connection: connection(),
            route: RouteDescriptor::new("Q1", "E1", "orders"),
            profile,
        };
        let worker = Arc::new(ConsumerWorker::new(definition, Arc::new(broker.clone())).unwrap());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(worker.clone().run(cancel.clone()));
        for _ in 0..200 {
            if broker.consumer_count("Q1") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(broker.deliver("E1", "orders", b"hello"), 1);
        for _ in 0..200 {
            if broker.acks().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let files = files_in(&output);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].extension().unwrap(), "xml");
        assert_eq!(std::fs::read_to_string(&files[0]).unwrap(), "hello");

        let acks = broker.acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].kind, AckKind::Ack);
        assert_eq!(acks[0].delivery_tag, 1);
        assert_eq!(worker.status().processed, 1);
        assert!(worker.status().healthy);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(broker.acks().len(), 1);
        assert_eq!(worker.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_faulted_worker_is_unhealthy_but_keeps_running() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let root = TempDir::new().unwrap();
        let worker = Arc::new(
            PublisherWorker::new(
                publisher_definition(root.path()),
                Arc::new(broker.clone()),
                PublishScheduler::new(Duration::from_secs(5)),
            )
            .unwrap(),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(worker.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(3)).await;

        let status = worker.status();
        assert_eq!(status.state, ConnectionState::Faulted);
        assert!(!status.healthy);
        assert!(!task.is_finished());

        cancel.cancel();
        task.await.unwrap();
    }
}
