//! Connection lifecycle: the resilient connection manager and the
//! per-worker channel slot.

pub mod channel;
pub mod manager;

pub use channel::{ChannelHandle, ChannelLease, ChannelSlot};
pub use manager::{ConnectionManager, CRITICAL_TARGET};
