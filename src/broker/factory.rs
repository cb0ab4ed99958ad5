//! Broker factory: turns a `ConnectionProfile` into a connection descriptor.
//!
//! Pure and deterministic. All validation happens here so that a bad
//! profile fails before any network attempt.

use std::collections::BTreeMap;

use crate::error::RelayError;
use crate::types::{BackendKind, ConnectionProfile};

/// Default AMQP port.
pub const AMQP_PORT: u16 = 5672;

/// Default AMQP port with TLS.
pub const AMQPS_PORT: u16 = 5671;

/// SASL mechanism used to authenticate an AMQP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmqpAuth {
    /// Username and password
    Plain,
    /// Client certificate (TLS)
    External,
}

/// TLS part of an AMQP descriptor.
///
/// The certificate is verified against the descriptor's host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpTls {
    pub cert_path: Option<String>,
    pub cert_passphrase: String,
    pub ca_path: Option<String>,
}

/// Everything the AMQP backend needs to open a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpDescriptor {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    pub connection_name: Option<String>,
    pub auth: AmqpAuth,
    pub tls: Option<AmqpTls>,
}

/// librdkafka client properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaDescriptor {
    pub properties: BTreeMap<String, String>,
}

impl KafkaDescriptor {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Broker-native connection descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    Amqp(AmqpDescriptor),
    Kafka(KafkaDescriptor),
}

impl ConnectionDescriptor {
    /// Host part for logs; never contains credentials.
    pub fn display_host(&self) -> String {
        match self {
            ConnectionDescriptor::Amqp(d) => format!("{}:{}", d.host, d.port),
            ConnectionDescriptor::Kafka(d) => d.get("bootstrap.servers").unwrap_or_default().to_string(),
        }
    }
}

/// Build the descriptor for `profile`.
pub fn build_descriptor(profile: &ConnectionProfile) -> Result<ConnectionDescriptor, RelayError> {
    let host = profile.host.trim();
    if host.is_empty() {
        return Err(RelayError::InvalidConfiguration(
            "broker host is required".to_string(),
        ));
    }

    let tls = &profile.tls;
    if tls.enabled && !tls.cert_passphrase.is_empty() && tls.cert_path.trim().is_empty() {
        return Err(RelayError::InvalidConfiguration(
            "tls certificate passphrase given without a certificate path".to_string(),
        ));
    }

    match profile.backend {
        BackendKind::Amqp => amqp_descriptor(profile, host).map(ConnectionDescriptor::Amqp),
        BackendKind::Kafka => kafka_descriptor(profile, host).map(ConnectionDescriptor::Kafka),
    }
}

fn amqp_descriptor(profile: &ConnectionProfile, host: &str) -> Result<AmqpDescriptor, RelayError> {
    let default_port = if profile.tls.enabled { AMQPS_PORT } else { AMQP_PORT };
    let (host, port) = split_host_port(host, default_port)?;

    if host.contains(',') {
        return Err(RelayError::InvalidConfiguration(format!(
            "amqp host must be a single host, got '{}'",
            host
        )));
    }

    let tls = if profile.tls.enabled {
        if profile.tls.cert_path.trim().is_empty() {
            return Err(RelayError::InvalidConfiguration(
                "tls is enabled but no certificate path is configured".to_string(),
            ));
        }
        check_server_name(&profile.tls.server_name, &[host.as_str()])?;
        Some(AmqpTls {
            cert_path: non_empty(&profile.tls.cert_path),
            cert_passphrase: profile.tls.cert_passphrase.clone(),
            ca_path: non_empty(&profile.tls.ca_path),
        })
    } else {
        None
    };

    Ok(AmqpDescriptor {
        host,
        port,
        virtual_host: if profile.virtual_host.is_empty() {
            "/".to_string()
        } else {
            profile.virtual_host.clone()
        },
        username: profile.username.clone(),
        password: profile.password.clone(),
        connection_name: non_empty(&profile.client_name),
        auth: if tls.is_some() {
            AmqpAuth::External
        } else {
            AmqpAuth::Plain
        },
        tls,
    })
}

fn kafka_descriptor(profile: &ConnectionProfile, host: &str) -> Result<KafkaDescriptor, RelayError> {
    let servers: Vec<&str> = host
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let names = servers
        .iter()
        .map(|server| split_host_port(server, 9092).map(|(name, _)| name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut properties = BTreeMap::new();
    properties.insert("bootstrap.servers".to_string(), servers.join(","));
    if let Some(client_id) = non_empty(&profile.client_name) {
        properties.insert("client.id".to_string(), client_id);
    }

    let has_credentials = !profile.username.is_empty();
    let protocol = match (profile.tls.enabled, has_credentials) {
        (true, true) => "sasl_ssl",
        (true, false) => "ssl",
        (false, true) => "sasl_plaintext",
        (false, false) => "plaintext",
    };
    properties.insert("security.protocol".to_string(), protocol.to_string());

    if has_credentials {
        properties.insert("sasl.mechanisms".to_string(), "PLAIN".to_string());
        properties.insert("sasl.username".to_string(), profile.username.clone());
        properties.insert("sasl.password".to_string(), profile.password.clone());
    }

    if profile.tls.enabled {
        let tls = &profile.tls;
        let hosts: Vec<&str> = names.iter().map(String::as_str).collect();
        check_server_name(&tls.server_name, &hosts)?;
        if let Some(ca) = non_empty(&tls.ca_path) {
            properties.insert("ssl.ca.location".to_string(), ca);
        }
        if let Some(cert) = non_empty(&tls.cert_path) {
            properties.insert("ssl.certificate.location".to_string(), cert);
        }
        if let Some(key) = non_empty(&tls.key_path) {
            properties.insert("ssl.key.location".to_string(), key);
        }
        if !tls.cert_passphrase.is_empty() {
            properties.insert("ssl.key.password".to_string(), tls.cert_passphrase.clone());
        }
        properties.insert(
            "ssl.endpoint.identification.algorithm".to_string(),
            "https".to_string(),
        );
    }

    Ok(KafkaDescriptor { properties })
}

/// The TLS clients verify the broker certificate against the host they dial,
/// so a configured server name has to be that host.
fn check_server_name(server_name: &str, hosts: &[&str]) -> Result<(), RelayError> {
    let server_name = server_name.trim();
    if server_name.is_empty() {
        return Ok(());
    }
    match hosts.iter().find(|host| !host.eq_ignore_ascii_case(server_name)) {
        Some(host) => Err(RelayError::InvalidConfiguration(format!(
            "tls server name '{}' differs from host '{}'; use the certificate name as host",
            server_name, host
        ))),
        None => Ok(()),
    }
}

/// Profile settings that no backend acts on.
///
/// Connection and topology recovery always run in the connection manager.
pub fn ignored_settings(profile: &ConnectionProfile) -> Vec<&'static str> {
    let mut ignored = Vec::new();
    if profile.automatic_recovery {
        ignored.push("automatic_recovery");
    }
    if profile.topology_recovery {
        ignored.push("topology_recovery");
    }
    ignored
}

fn split_host_port(host: &str, default_port: u16) -> Result<(String, u16), RelayError> {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() => {
            let port: u16 = port.parse().map_err(|_| {
                RelayError::InvalidConfiguration(format!("invalid port in '{}'", host))
            })?;
            if port == 0 {
                return Err(RelayError::InvalidConfiguration(format!(
                    "invalid port in '{}'",
                    host
                )));
            }
            Ok((name.to_string(), port))
        }
        Some(_) => Err(RelayError::InvalidConfiguration(format!(
            "invalid host '{}'",
            host
        ))),
        None => Ok((host.to_string(), default_port)),
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TlsSettings;
    use pretty_assertions::assert_eq;

    fn amqp(host: &str) -> ConnectionProfile {
        ConnectionProfile::new(BackendKind::Amqp, host).with_credentials("guest", "guest")
    }

    #[test]
    fn test_amqp_defaults() {
        let descriptor = build_descriptor(&amqp("rabbit.local")).unwrap();
        let ConnectionDescriptor::Amqp(d) = descriptor else {
            panic!("expected amqp descriptor");
        };

        assert_eq!(d.host, "rabbit.local");
        assert_eq!(d.port, AMQP_PORT);
        assert_eq!(d.virtual_host, "/");
        assert_eq!(d.auth, AmqpAuth::Plain);
        assert_eq!(d.connection_name, None);
        assert!(d.tls.is_none());
    }

    #[test]
    fn test_amqp_tls_uses_external_auth() {
        let mut profile = amqp("rabbit.local").with_client_name("relay-1");
        profile.tls = TlsSettings {
            enabled: true,
            cert_path: "/etc/relay/client.p12".to_string(),
            cert_passphrase: "pw".to_string(),
            ..Default::default()
        };

        let ConnectionDescriptor::Amqp(d) = build_descriptor(&profile).unwrap() else {
            panic!("expected amqp descriptor");
        };
        assert_eq!(d.port, AMQPS_PORT);
        assert_eq!(d.auth, AmqpAuth::External);
        assert_eq!(d.connection_name.as_deref(), Some("relay-1"));

        let tls = d.tls.unwrap();
        assert_eq!(tls.cert_path.as_deref(), Some("/etc/relay/client.p12"));
    }

    #[test]
    fn test_tls_server_name_must_match_host() {
        let mut profile = amqp("10.0.0.5:5671");
        profile.tls = TlsSettings {
            enabled: true,
            server_name: "rabbit.prod".to_string(),
            cert_path: "/etc/relay/client.p12".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            build_descriptor(&profile),
            Err(RelayError::InvalidConfiguration(_))
        ));

        profile.host = "Rabbit.Prod:5671".to_string();
        let ConnectionDescriptor::Amqp(d) = build_descriptor(&profile).unwrap() else {
            panic!("expected amqp descriptor");
        };
        assert_eq!(d.host, "Rabbit.Prod");

        let mut kafka = ConnectionProfile::new(BackendKind::Kafka, "k1:9093,k2:9093");
        kafka.tls = TlsSettings {
            enabled: true,
            server_name: "k1".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            build_descriptor(&kafka),
            Err(RelayError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_recovery_flags_are_reported_as_ignored() {
        let mut profile = amqp("rabbit.local");
        assert!(ignored_settings(&profile).is_empty());

        profile.automatic_recovery = true;
        profile.topology_recovery = true;
        assert_eq!(
            ignored_settings(&profile),
            vec!["automatic_recovery", "topology_recovery"]
        );
        assert!(build_descriptor(&profile).is_ok());
    }

    #[test]
    fn test_explicit_port() {
        let ConnectionDescriptor::Amqp(d) = build_descriptor(&amqp("10.0.0.5:15672")).unwrap() else {
            panic!("expected amqp descriptor");
        };
        assert_eq!(d.host, "10.0.0.5");
        assert_eq!(d.port, 15672);
    }

    #[test]
    fn test_invalid_profiles_fail_fast() {
        assert!(matches!(
            build_descriptor(&amqp("  ")),
            Err(RelayError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            build_descriptor(&amqp("host:notaport")),
            Err(RelayError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            build_descriptor(&amqp("host:0")),
            Err(RelayError::InvalidConfiguration(_))
        ));

        let mut no_cert = amqp("host");
        no_cert.tls.enabled = true;
        assert!(matches!(
            build_descriptor(&no_cert),
            Err(RelayError::InvalidConfiguration(_))
        ));

        let mut passphrase_only = amqp("host");
        passphrase_only.tls.enabled = true;
        passphrase_only.tls.cert_passphrase = "pw".to_string();
        assert!(matches!(
            build_descriptor(&passphrase_only),
            Err(RelayError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_kafka_properties() {
        let mut profile = ConnectionProfile::new(BackendKind::Kafka, "k1:9092, k2:9092")
            .with_client_name("relay");
        profile.tls = TlsSettings {
            enabled: true,
            ca_path: "/etc/ca.pem".to_string(),
            cert_path: "/etc/client.pem".to_string(),
            key_path: "/etc/client.key".to_string(),
            ..Default::default()
        };

        let ConnectionDescriptor::Kafka(d) = build_descriptor(&profile).unwrap() else {
            panic!("expected kafka descriptor");
        };
        assert_eq!(d.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(d.get("client.id"), Some("relay"));
        assert_eq!(d.get("security.protocol"), Some("ssl"));
        assert_eq!(d.get("ssl.ca.location"), Some("/etc/ca.pem"));
        assert_eq!(d.get("ssl.key.location"), Some("/etc/client.key"));
        assert_eq!(d.get("sasl.username"), None);
    }

    #[test]
    fn test_descriptor_is_deterministic() {
        let profile = amqp("rabbit.local:5672");
        assert_eq!(
            build_descriptor(&profile).unwrap(),
            build_descriptor(&profile).unwrap()
        );
    }
}
