//! Channel ownership.
//!
//! Every worker owns exactly one channel. The slot hands out exclusive
//! leases on it and transparently replaces it once the connection it was
//! opened on is gone.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::ConnectionManager;
use crate::broker::BrokerChannel;
use crate::error::{RelayError, Result};

/// An open channel together with its identity.
///
/// `id` is unique per manager and changes whenever a channel is recreated;
/// delivery tags are scoped to it.
#[derive(Clone)]
pub struct ChannelHandle {
    channel: Arc<dyn BrokerChannel>,
    id: u64,
    connection_epoch: u64,
}

impl ChannelHandle {
    pub(crate) fn new(channel: Arc<dyn BrokerChannel>, id: u64, connection_epoch: u64) -> Self {
        Self {
            channel,
            id,
            connection_epoch,
        }
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection_epoch(&self) -> u64 {
        self.connection_epoch
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("connection_epoch", &self.connection_epoch)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Exclusive access to a worker's channel.
///
/// Holding the lease serializes every operation on the channel.
pub struct ChannelLease<'a> {
    _guard: MutexGuard<'a, Option<ChannelHandle>>,
    handle: ChannelHandle,
    fresh: bool,
}

impl ChannelLease<'_> {
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        self.handle.channel()
    }

    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    /// Whether the channel was opened by this lease.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }
}

/// Single-channel slot owned by one worker.
pub struct ChannelSlot {
    manager: Arc<ConnectionManager>,
    current: Mutex<Option<ChannelHandle>>,
}

impl ChannelSlot {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            current: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Lease the channel, connecting and reopening it when needed.
    pub async fn lease(&self) -> Result<ChannelLease<'_>> {
        let epoch = self.manager.ensure_connected().await?;
        let mut guard = self.current.lock().await;

        let reusable = guard
            .as_ref()
            .filter(|h| h.connection_epoch == epoch && h.is_open())
            .cloned();

        let (handle, fresh) = match reusable {
            Some(handle) => (handle, false),
            None => {
                if let Some(stale) = guard.take() {
                    debug!(channel_id = stale.id, "Replacing stale channel");
                    let _ = stale.channel.close().await;
                }
                let handle = self.manager.create_channel().await?;
                *guard = Some(handle.clone());
                (handle, true)
            }
        };

        Ok(ChannelLease {
            _guard: guard,
            handle,
            fresh,
        })
    }

    /// Lease the current channel without reconnecting.
    ///
    /// Fails with `NotConnected` when there is no open channel.
    pub async fn lease_existing(&self) -> Result<ChannelLease<'_>> {
        if self.manager.is_disposed() {
            return Err(RelayError::Disposed);
        }
        let guard = self.current.lock().await;
        let handle = guard
            .as_ref()
            .filter(|h| h.is_open())
            .cloned()
            .ok_or(RelayError::NotConnected)?;

        Ok(ChannelLease {
            _guard: guard,
            handle,
            fresh: false,
        })
    }

    /// Id of the channel currently in the slot.
    pub async fn current_id(&self) -> Option<u64> {
        self.current.lock().await.as_ref().map(ChannelHandle::id)
    }

    /// Close and forget the channel.
    pub async fn close(&self) {
        let handle = self.current.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.channel.close().await;
        }
    }
}
