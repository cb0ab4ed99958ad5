//! Connection manager.
//!
//! Owns one physical broker connection and keeps it alive:
//!
//! - `connect` runs a fixed-interval retry policy and ends `Connected` or,
//!   after exhausting retries, `Faulted`
//! - shutdown / callback-exception / blocked signals of a live connection
//!   start a reconnect on a separate task; a mutex makes sure only one
//!   reconnect runs at a time and duplicate or stale signals are dropped
//! - `dispose` detaches from signals and closes channels and connection

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::ChannelHandle;
use crate::broker::{
    build_descriptor, factory::ignored_settings, BrokerBackend, BrokerChannel, BrokerConnection, ConnectionDescriptor,
    ConnectionSignal, Connected,
};
use crate::error::{RelayError, Result};
use crate::retry::RetryPolicy;
use crate::types::{ConnectionProfile, ConnectionState};

/// Log target for critical events (retries exhausted).
pub const CRITICAL_TARGET: &str = "broker_relay::critical";

struct LiveConnection {
    connection: Arc<dyn BrokerConnection>,
    epoch: u64,
}

/// Resilient owner of a broker connection.
pub struct ConnectionManager {
    name: String,
    descriptor: ConnectionDescriptor,
    backend: Arc<dyn BrokerBackend>,
    policy: RetryPolicy,
    retry_wait: Duration,
    current: Mutex<Option<LiveConnection>>,
    epoch: AtomicU64,
    next_channel_id: AtomicU64,
    channels: Mutex<Vec<Weak<dyn BrokerChannel>>>,
    state: watch::Sender<ConnectionState>,
    reconnect_guard: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
    faults: AtomicU64,
    signal_reconnects: AtomicU64,
    shutdown: CancellationToken,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Create a manager for `profile`.
    ///
    /// The profile is validated here; no connection is attempted until
    /// `connect` or an operation that needs one.
    pub fn new(
        name: &str,
        profile: &ConnectionProfile,
        backend: Arc<dyn BrokerBackend>,
    ) -> Result<Arc<Self>> {
        let descriptor = build_descriptor(profile)?;
        let ignored = ignored_settings(profile);
        if !ignored.is_empty() {
            warn!(
                connection = %name,
                settings = ?ignored,
                "Client-side recovery settings are ignored; the connection manager recovers connections and topology"
            );
        }
        let policy = RetryPolicy::fixed(profile.retry_count, profile.retry_wait());
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            descriptor,
            backend,
            policy,
            retry_wait: profile.retry_wait(),
            current: Mutex::new(None),
            epoch: AtomicU64::new(0),
            next_channel_id: AtomicU64::new(0),
            channels: Mutex::new(Vec::new()),
            state,
            reconnect_guard: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
            faults: AtomicU64::new(0),
            signal_reconnects: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            this: this.clone(),
        }))
    }

    fn current(&self) -> MutexGuard<'_, Option<LiveConnection>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Retries per connect cycle.
    pub fn retry_count(&self) -> u32 {
        self.policy.max_retries
    }

    /// Wait between connect attempts.
    pub fn retry_wait(&self) -> Duration {
        self.retry_wait
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of the current (or last) physical connection.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Times the retry policy was exhausted.
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::SeqCst)
    }

    /// Reconnects started by connection signals.
    pub fn signal_reconnect_count(&self) -> u64 {
        self.signal_reconnects.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        !self.is_disposed() && self.state().is_healthy()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Whether the last known connection reports open.
    pub fn is_connected(&self) -> bool {
        self.connected_epoch().is_some()
    }

    fn connected_epoch(&self) -> Option<u64> {
        if self.is_disposed() {
            return None;
        }
        self.current()
            .as_ref()
            .filter(|live| live.connection.is_open())
            .map(|live| live.epoch)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(connection = %self.name, from = %previous, to = %state, "Connection state changed");
        }
    }

    /// Establish the connection, retrying transient failures.
    ///
    /// Returns true iff a connection is open when the policy finishes.
    pub async fn connect(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        let _guard = self.reconnect_guard.lock().await;
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        if self.is_connected() {
            return true;
        }

        self.set_state(ConnectionState::Connecting);
        let result = self
            .policy
            .execute("connect", || async {
                let connected = self.backend.connect(&self.descriptor).await?;
                self.install(connected).await
            })
            .await;

        match result {
            Ok(()) => {
                info!(
                    connection = %self.name,
                    backend = self.backend.name(),
                    host = %self.descriptor.display_host(),
                    epoch = self.epoch(),
                    "Acquired a persistent connection and subscribed to failure events"
                );
                true
            }
            Err(RelayError::Disposed) => false,
            Err(e) if e.is_transient() => {
                self.faults.fetch_add(1, Ordering::SeqCst);
                self.set_state(ConnectionState::Faulted);
                error!(
                    target: CRITICAL_TARGET,
                    connection = %self.name,
                    host = %self.descriptor.display_host(),
                    retries = self.policy.max_retries,
                    error = %e,
                    "Fatal error: broker connection could not be created and opened"
                );
                false
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                error!(
                    connection = %self.name,
                    host = %self.descriptor.display_host(),
                    error = %e,
                    "Broker refused the connection"
                );
                false
            }
        }
    }

    async fn install(&self, connected: Connected) -> Result<()> {
        let Connected {
            connection,
            signals,
        } = connected;

        if !connection.is_open() {
            return Err(RelayError::NotConnected);
        }
        if self.is_disposed() {
            let _ = connection.close().await;
            return Err(RelayError::Disposed);
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.current().replace(LiveConnection {
            connection,
            epoch,
        });
        if let Some(previous) = previous {
            let _ = previous.connection.close().await;
        }

        self.listen(epoch, signals);
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    fn listen(&self, epoch: u64, mut signals: mpsc::UnboundedReceiver<ConnectionSignal>) {
        let manager = self.this.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    signal = signals.recv() => match signal {
                        Some(signal) => signal,
                        None => break,
                    },
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.on_signal(epoch, signal);
            }
        });
    }

    fn on_signal(self: Arc<Self>, epoch: u64, signal: ConnectionSignal) {
        if self.is_disposed() {
            return;
        }
        warn!(
            connection = %self.name,
            signal = %signal,
            epoch,
            "Broker connection signalled a failure, trying to re-connect"
        );
        tokio::spawn(async move {
            self.reconnect(epoch).await;
        });
    }

    async fn reconnect(&self, epoch: u64) {
        let Ok(_guard) = self.reconnect_guard.try_lock() else {
            debug!(connection = %self.name, "Reconnect already in flight, ignoring signal");
            return;
        };
        if self.is_disposed() || self.epoch() != epoch {
            debug!(connection = %self.name, epoch, "Ignoring signal from a replaced connection");
            return;
        }

        self.signal_reconnects.fetch_add(1, Ordering::SeqCst);
        let previous = self.current().take();
        if let Some(previous) = previous {
            let _ = previous.connection.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
        self.connect_locked().await;
    }

    /// Connect if needed and return the connection epoch.
    pub async fn ensure_connected(&self) -> Result<u64> {
        if self.is_disposed() {
            return Err(RelayError::Disposed);
        }
        if let Some(epoch) = self.connected_epoch() {
            return Ok(epoch);
        }
        self.connect().await;
        if self.is_disposed() {
            return Err(RelayError::Disposed);
        }
        self.connected_epoch().ok_or(RelayError::NotConnected)
    }

    /// Wait until the manager is connected or `cancel` fires.
    ///
    /// Returns false on cancellation or disposal.
    pub async fn wait_until_connected(&self, cancel: &CancellationToken) -> bool {
        let mut state = self.subscribe_state();
        loop {
            if self.is_disposed() {
                return false;
            }
            if self.is_connected() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = state.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Open a new channel on the current connection.
    pub async fn create_channel(&self) -> Result<ChannelHandle> {
        if self.is_disposed() {
            return Err(RelayError::Disposed);
        }
        let (connection, epoch) = {
            let current = self.current();
            match current.as_ref() {
                Some(live) if live.connection.is_open() => (live.connection.clone(), live.epoch),
                _ => return Err(RelayError::NotConnected),
            }
        };

        let channel = connection.create_channel().await?;
        let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
            channels.retain(|c| c.strong_count() > 0);
            channels.push(Arc::downgrade(&channel));
        }
        debug!(connection = %self.name, channel_id = id, epoch, "Opened channel");

        Ok(ChannelHandle::new(channel, id, epoch))
    }

    /// Detach from signals and close every channel and the connection.
    ///
    /// Safe to call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let channels: Vec<_> = std::mem::take(
            &mut *self.channels.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for channel in channels.iter().filter_map(Weak::upgrade) {
            if let Err(e) = channel.close().await {
                debug!(connection = %self.name, error = %e, "Channel close failed during dispose");
            }
        }

        let current = self.current().take();
        if let Some(live) = current {
            if let Err(e) = live.connection.close().await {
                debug!(connection = %self.name, error = %e, "Connection close failed during dispose");
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!(connection = %self.name, "Connection manager disposed");
    }
}
