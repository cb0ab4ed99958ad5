//! Relay settings, loaded from a settings file plus environment overrides.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use super::profile::{
    BackendKind, ConnectionProfile, ConsumerProfile, PublisherProfile, RouteDescriptor,
    TlsSettings,
};
use crate::error::RelayError;
use crate::{
    DEFAULT_PROCESSING_INTERVAL_MS, DEFAULT_RETRY_COUNT, DEFAULT_WAIT_AND_RETRY_SECONDS,
};

/// Environment variable prefix for overrides, e.g. `RELAY__LOG__JSON=true`.
pub const ENV_PREFIX: &str = "RELAY";

/// Top-level relay settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log: LogSettings,
    pub health: HealthSettings,
    pub services: ServicesSettings,
}

/// Log output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Emit JSON lines instead of human readable output
    pub json: bool,
    /// Filter used when `RUST_LOG` is not set
    pub filter: Option<String>,
}

/// Health endpoint settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Address to serve `GET /health` on; disabled when unset
    pub listen: Option<SocketAddr>,
}

/// Per-backend service sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesSettings {
    pub rabbitmq: BackendSettings,
    pub kafka: BackendSettings,
}

/// Brokers, consumers and publishers of one backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub enabled: bool,
    pub brokers: BTreeMap<String, BrokerSettings>,
    pub consumers: BTreeMap<String, ConsumerSettings>,
    pub publishers: PublisherGroupSettings,
}

/// Connection parameters of a named broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    pub client_name: String,
    pub tls: TlsSettings,
    pub automatic_recovery: bool,
    pub topology_recovery: bool,
    /// 0 means the default of 3
    pub retry_count: u32,
    /// 0 means the default of 60
    pub wait_and_retry_seconds: u64,
}

/// A consumer that writes each message to a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    pub enabled: bool,
    pub broker: String,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub consumer_tag: String,
    pub auto_ack: bool,
    pub file_directory: Option<PathBuf>,
    pub file_extension: Option<String>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            broker: String::new(),
            queue: String::new(),
            exchange: String::new(),
            routing_key: String::new(),
            consumer_tag: String::new(),
            auto_ack: false,
            file_directory: None,
            file_extension: None,
        }
    }
}

/// Publishers of a backend and their shared scan interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherGroupSettings {
    pub processing_interval_ms: u64,
    pub items: BTreeMap<String, PublisherSettings>,
}

impl Default for PublisherGroupSettings {
    fn default() -> Self {
        Self {
            processing_interval_ms: DEFAULT_PROCESSING_INTERVAL_MS,
            items: BTreeMap::new(),
        }
    }
}

/// A publisher fed from a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSettings {
    pub enabled: bool,
    pub broker: String,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub confirm_publish: bool,
    pub file_directory: PathBuf,
    pub file_extension: String,
    pub completion_directory: PathBuf,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            broker: String::new(),
            queue: String::new(),
            exchange: String::new(),
            routing_key: String::new(),
            confirm_publish: false,
            file_directory: PathBuf::new(),
            file_extension: String::new(),
            completion_directory: PathBuf::new(),
        }
    }
}

/// A fully resolved consumer worker definition.
#[derive(Debug, Clone)]
pub struct ConsumerDefinition {
    pub name: String,
    pub connection: ConnectionProfile,
    pub route: RouteDescriptor,
    pub profile: ConsumerProfile,
}

/// A fully resolved publisher worker definition.
#[derive(Debug, Clone)]
pub struct PublisherDefinition {
    pub name: String,
    pub connection: ConnectionProfile,
    pub route: RouteDescriptor,
    pub profile: PublisherProfile,
}

impl Settings {
    /// Load settings from `path` and `RELAY__*` environment variables.
    ///
    /// The file format follows the extension (toml, json, yaml). A missing
    /// file is an error; every section of it is optional.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Backend sections paired with their kind, in a stable order.
    pub fn backends(&self) -> [(BackendKind, &BackendSettings); 2] {
        [
            (BackendKind::Amqp, &self.services.rabbitmq),
            (BackendKind::Kafka, &self.services.kafka),
        ]
    }
}

impl BrokerSettings {
    /// Build the connection profile, applying retry defaults for zero values.
    pub fn to_profile(&self, backend: BackendKind) -> ConnectionProfile {
        ConnectionProfile {
            backend,
            host: self.host.clone(),
            virtual_host: self.virtual_host.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            client_name: self.client_name.clone(),
            tls: self.tls.clone(),
            automatic_recovery: self.automatic_recovery,
            topology_recovery: self.topology_recovery,
            retry_count: if self.retry_count == 0 {
                DEFAULT_RETRY_COUNT
            } else {
                self.retry_count
            },
            wait_and_retry_seconds: if self.wait_and_retry_seconds == 0 {
                DEFAULT_WAIT_AND_RETRY_SECONDS
            } else {
                self.wait_and_retry_seconds
            },
        }
    }
}

impl BackendSettings {
    fn broker_profile(
        &self,
        backend: BackendKind,
        owner: &str,
        broker: &str,
    ) -> Result<ConnectionProfile, RelayError> {
        self.brokers
            .get(broker)
            .map(|b| b.to_profile(backend))
            .ok_or_else(|| {
                RelayError::InvalidConfiguration(format!(
                    "{} references unknown broker '{}'",
                    owner, broker
                ))
            })
    }

    /// Resolve every enabled consumer against its broker.
    pub fn consumer_definitions(
        &self,
        backend: BackendKind,
    ) -> Result<Vec<ConsumerDefinition>, RelayError> {
        self.consumers
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(name, c)| {
                let tag = if c.consumer_tag.is_empty() {
                    name.clone()
                } else {
                    c.consumer_tag.clone()
                };
                Ok(ConsumerDefinition {
                    name: name.clone(),
                    connection: self.broker_profile(backend, name, &c.broker)?,
                    route: RouteDescriptor::new(&c.queue, &c.exchange, &c.routing_key),
                    profile: ConsumerProfile {
                        consumer_tag: tag,
                        auto_ack: c.auto_ack,
                        file_directory: c.file_directory.clone(),
                        file_extension: c.file_extension.clone(),
                    },
                })
            })
            .collect()
    }

    /// Resolve every enabled publisher against its broker.
    pub fn publisher_definitions(
        &self,
        backend: BackendKind,
    ) -> Result<Vec<PublisherDefinition>, RelayError> {
        self.publishers
            .items
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(name, p)| {
                if p.file_directory.as_os_str().is_empty() {
                    return Err(RelayError::InvalidConfiguration(format!(
                        "publisher '{}' has no file_directory",
                        name
                    )));
                }
                if p.completion_directory.as_os_str().is_empty() {
                    return Err(RelayError::InvalidConfiguration(format!(
                        "publisher '{}' has no completion_directory",
                        name
                    )));
                }
                Ok(PublisherDefinition {
                    name: name.clone(),
                    connection: self.broker_profile(backend, name, &p.broker)?,
                    route: RouteDescriptor::new(&p.queue, &p.exchange, &p.routing_key),
                    profile: PublisherProfile {
                        confirm_publish: p.confirm_publish,
                        file_directory: p.file_directory.clone(),
                        file_extension: p.file_extension.clone(),
                        completion_directory: p.completion_directory.clone(),
                    },
                })
            })
            .collect()
    }
}
