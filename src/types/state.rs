//! Connection lifecycle state.

use serde::{Deserialize, Serialize};

/// State of a broker connection as driven by its connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No open connection; the next operation will try to connect
    Disconnected,
    /// A connect attempt (with its retry policy) is in progress
    Connecting,
    /// The connection is open
    Connected,
    /// Retries were exhausted; waits for an explicit `connect`
    Faulted,
}

impl ConnectionState {
    /// Whether a worker in this state counts as healthy.
    pub fn is_healthy(&self) -> bool {
        !matches!(self, ConnectionState::Faulted)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Faulted => write!(f, "faulted"),
        }
    }
}
