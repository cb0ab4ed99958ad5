//! Error types for the relay.
//!
//! `BrokerError` is what backends report; `RelayError` is what the public
//! connection, consumer and publisher operations return.

use std::io;

use thiserror::Error;

/// Errors reported by a broker backend.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached (DNS, refused, handshake timeout).
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// Socket level failure on an established connection.
    #[error("socket failure: {0}")]
    Socket(#[from] io::Error),

    /// The connection or channel was closed underneath the caller.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The broker refused the credentials or TLS material.
    #[error("access refused: {0}")]
    AccessRefused(String),

    /// The broker reported a protocol level error for an operation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Unreachable(_) | BrokerError::Socket(_) | BrokerError::ConnectionClosed(_)
        )
    }
}

/// Errors returned by the relay's public operations.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("not connected to broker")]
    NotConnected,

    #[error("queue is not bound; call bind_queue first")]
    NotBound,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("component has been disposed")]
    Disposed,

    /// A delivery tag from an earlier channel was used on the current one.
    #[error("delivery tag {tag} belongs to channel epoch {epoch}, current epoch is {current}")]
    StaleDeliveryTag { tag: u64, epoch: u64, current: u64 },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Whether the underlying cause is a transient broker failure.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::NotConnected => true,
            RelayError::Broker(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
