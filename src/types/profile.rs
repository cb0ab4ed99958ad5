//! Connection, route, consumer and publisher profiles.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_FILE_EXTENSION, DEFAULT_RETRY_COUNT, DEFAULT_WAIT_AND_RETRY_SECONDS};

/// Which broker protocol a profile talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// AMQP 0-9-1 exchange/queue broker (RabbitMQ)
    Amqp,
    /// Topic/partition broker (Kafka)
    Kafka,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Amqp => write!(f, "amqp"),
            BackendKind::Kafka => write!(f, "kafka"),
        }
    }
}

/// TLS settings for a broker connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    /// Expected server certificate name; when set it must equal the host
    pub server_name: String,
    /// Client certificate (PKCS#12 for AMQP, PEM for Kafka)
    pub cert_path: String,
    pub cert_passphrase: String,
    /// CA bundle used to verify the broker
    pub ca_path: String,
    /// Client private key (Kafka only)
    pub key_path: String,
}

/// Everything needed to open a connection to one broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub backend: BackendKind,
    /// `host[:port]` for AMQP, comma-separated bootstrap servers for Kafka
    pub host: String,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    pub client_name: String,
    pub tls: TlsSettings,
    pub automatic_recovery: bool,
    pub topology_recovery: bool,
    /// Retries after the first failed connection attempt
    pub retry_count: u32,
    /// Fixed wait between connection attempts
    pub wait_and_retry_seconds: u64,
}

impl ConnectionProfile {
    /// Create a profile with default credentials and retry policy.
    pub fn new(backend: BackendKind, host: impl Into<String>) -> Self {
        Self {
            backend,
            host: host.into(),
            virtual_host: String::new(),
            username: String::new(),
            password: String::new(),
            client_name: String::new(),
            tls: TlsSettings::default(),
            automatic_recovery: false,
            topology_recovery: false,
            retry_count: DEFAULT_RETRY_COUNT,
            wait_and_retry_seconds: DEFAULT_WAIT_AND_RETRY_SECONDS,
        }
    }

    /// Set the credentials.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    /// Set the retry policy used by `connect`.
    pub fn with_retry(mut self, retry_count: u32, wait_and_retry_seconds: u64) -> Self {
        self.retry_count = retry_count;
        self.wait_and_retry_seconds = wait_and_retry_seconds;
        self
    }

    /// Set the client-provided connection name.
    pub fn with_client_name(mut self, name: &str) -> Self {
        self.client_name = name.to_string();
        self
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(self.wait_and_retry_seconds)
    }
}

/// Where a consumer binds and where a publisher sends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDescriptor {
    /// Queue name (consumer group id on Kafka)
    pub queue: String,
    /// Exchange name (topic on Kafka)
    pub exchange: String,
    /// Routing key (record key on Kafka)
    pub routing_key: String,
}

impl RouteDescriptor {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> Self {
        Self {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        }
    }
}

/// Consumer-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerProfile {
    /// Unique label for this consumer on its channel
    pub consumer_tag: String,
    /// Let the broker consider messages acknowledged on delivery
    pub auto_ack: bool,
    /// Output directory for materialized messages; current directory when unset
    pub file_directory: Option<PathBuf>,
    /// Output extension; `.xml` when unset
    pub file_extension: Option<String>,
}

impl ConsumerProfile {
    pub fn new(consumer_tag: &str) -> Self {
        Self {
            consumer_tag: consumer_tag.to_string(),
            auto_ack: false,
            file_directory: None,
            file_extension: None,
        }
    }

    /// Resolved output directory.
    pub fn output_directory(&self) -> PathBuf {
        match &self.file_directory {
            Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
            _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Resolved output extension, always starting with a dot.
    pub fn output_extension(&self) -> String {
        match self.file_extension.as_deref().map(str::trim) {
            Some(ext) if !ext.is_empty() => normalize_extension(ext),
            _ => DEFAULT_FILE_EXTENSION.to_string(),
        }
    }
}

/// Publisher-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherProfile {
    /// Put the channel in confirm mode before publishing
    pub confirm_publish: bool,
    /// Directory scanned for outbound files
    pub file_directory: PathBuf,
    /// `;`-separated extension filter; empty matches every file
    pub file_extension: String,
    /// Where published files are moved
    pub completion_directory: PathBuf,
}

impl PublisherProfile {
    /// Parsed extension filter, lower-cased and dot-prefixed.
    pub fn extensions(&self) -> Vec<String> {
        self.file_extension
            .split(';')
            .map(str::trim)
            .filter(|ext| !ext.is_empty())
            .map(normalize_extension)
            .collect()
    }
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_defaults() {
        let profile = ConnectionProfile::new(BackendKind::Amqp, "localhost");
        assert_eq!(profile.retry_count, 3);
        assert_eq!(profile.retry_wait(), Duration::from_secs(60));
    }

    #[test]
    fn test_consumer_extension_defaults() {
        let mut profile = ConsumerProfile::new("tag");
        assert_eq!(profile.output_extension(), ".xml");

        profile.file_extension = Some("json".to_string());
        assert_eq!(profile.output_extension(), ".json");

        profile.file_extension = Some("  ".to_string());
        assert_eq!(profile.output_extension(), ".xml");
    }

    #[test]
    fn test_publisher_extension_filter() {
        let profile = PublisherProfile {
            confirm_publish: false,
            file_directory: PathBuf::from("in"),
            file_extension: ".XML; json;;".to_string(),
            completion_directory: PathBuf::from("done"),
        };
        assert_eq!(profile.extensions(), vec![".xml".to_string(), ".json".to_string()]);
    }
}
