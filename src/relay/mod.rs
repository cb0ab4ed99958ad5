//! Filesystem relay: workers that move messages between broker queues and
//! directories, and the supervisor that runs them.

pub mod dir_scan;
pub mod file_sink;
pub mod scheduler;
pub mod supervisor;
pub mod worker;

pub use dir_scan::DirectoryScanner;
pub use file_sink::FileSink;
pub use scheduler::PublishScheduler;
pub use supervisor::{HealthReport, HealthStatus, Supervisor};
pub use worker::{ConsumerWorker, PublisherWorker, WorkerRole, WorkerStatus};
