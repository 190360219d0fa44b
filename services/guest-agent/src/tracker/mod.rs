//! Per-container port-mapping state machines.
//!
//! A tracker is the authoritative in-memory record of which host bindings
//! exist for each container, and the single place that drives the
//! forwarding transport. Event monitors only ever talk to a [`Tracker`];
//! the concrete variant is chosen once at startup by [`from_config`].
//!
//! Two variants exist:
//! - [`SocketTracker`] commits state only after the whole notification was
//!   forwarded; a failed send fails the call atomically.
//! - [`ApiTracker`] exposes bindings one by one through the gateway HTTP
//!   API and commits exactly the subset that succeeded, so storage always
//!   matches what the host actually knows about.

mod api;
mod listeners;
mod socket;
mod storage;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use portbridge_portmap::PortMap;

use crate::config::Config;
use crate::error::TrackerError;
use crate::forwarder::{Forwarder, TcpForwarder, UnixForwarder};
use crate::gateway::GatewayClient;

pub use api::ApiTracker;
pub use listeners::ListenerTracker;
pub use socket::SocketTracker;

/// Authoritative per-container port-mapping store plus forwarding
/// coordination. Listener methods delegate to an owned [`ListenerTracker`].
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Track `ports` for the container and forward an add notification.
    /// No-op when `ports` is empty. Replaces any existing entry wholesale.
    async fn add(&self, container_id: &str, ports: PortMap) -> Result<(), TrackerError>;

    /// Current mapping for the container; empty if untracked.
    async fn get(&self, container_id: &str) -> PortMap;

    /// Forward a remove notification for the stored entry and delete it.
    /// No-op (no network call) when the container is untracked.
    async fn remove(&self, container_id: &str) -> Result<(), TrackerError>;

    /// Remove every tracked entry, aggregating all forwarding errors and
    /// unconditionally clearing storage.
    async fn remove_all(&self) -> Result<(), TrackerError>;

    /// Track a reservation listener (idempotent).
    async fn add_listener(&self, ip: IpAddr, port: u16) -> Result<(), TrackerError>;

    /// Close a tracked reservation listener (no-op when untracked).
    async fn remove_listener(&self, ip: IpAddr, port: u16) -> Result<(), TrackerError>;
}

/// Build the tracker variant matching the configured deployment topology.
///
/// With a gateway URL configured the agent runs on the namespaced network
/// and ports are exposed through the gateway API; otherwise notifications
/// go through the socket transport alone and the privileged helper on the
/// host does the binding.
pub fn from_config(config: &Config) -> Arc<dyn Tracker> {
    let forwarder = notification_forwarder(config);

    if let Some(gateway_url) = &config.gateway_url {
        Arc::new(ApiTracker::new(
            GatewayClient::new(gateway_url.clone()),
            forwarder,
            config.tap_iface_ip.to_string(),
            config.admin_install,
        ))
    } else {
        Arc::new(SocketTracker::new(forwarder, config.connect_addrs()))
    }
}

/// The socket transport carrying notifications to the host-side proxy.
pub fn notification_forwarder(config: &Config) -> Arc<dyn Forwarder> {
    match &config.forwarder {
        crate::config::ForwarderAddr::Unix(path) => Arc::new(UnixForwarder::new(path)),
        crate::config::ForwarderAddr::Tcp(addr) => Arc::new(TcpForwarder::new(addr.clone())),
    }
}
