//! Transport-agnostic change-notification senders.
//!
//! A [`Forwarder`] ships one [`PortMapping`] across the guest/host boundary
//! per call. Three transports exist so the same tracker logic runs under
//! different deployment topologies, selected once at process startup:
//! a direct TCP socket, a local proxy unix socket, and the gateway HTTP API
//! (see [`crate::gateway`]).
//!
//! Sends are bounded: each attempt carries an I/O timeout and is retried
//! exactly once after a short delay. There is no backoff beyond that;
//! failures propagate to the caller immediately.

mod socket;

use async_trait::async_trait;
use portbridge_portmap::PortMapping;

use crate::error::ForwarderError;

pub use socket::{TcpForwarder, UnixForwarder};

/// Per-attempt I/O budget for a single notification.
pub const SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Delay before the single retry of a failed send.
pub const RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

/// Sends a port-mapping change notification to the host side.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn send(&self, mapping: PortMapping) -> Result<(), ForwarderError>;
}
