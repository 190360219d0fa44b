//! Tracker variant for the namespaced network: ports are exposed on the
//! host by calling the gateway's expose/unexpose API per binding.
//!
//! Partial failures do not abort the call: the subset of bindings that
//! exposed successfully is committed to storage and forwarded to the local
//! proxy, and the failures come back as one aggregated error. The gateway
//! API only supports IPv4, so any other host IP is skipped with a log line.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use portbridge_portmap::{ExposeRequest, PortMap, PortMapping, UnexposeRequest};
use tracing::{debug, warn};

use super::listeners::ListenerTracker;
use super::storage::PortStorage;
use super::Tracker;
use crate::error::TrackerError;
use crate::forwarder::Forwarder;
use crate::gateway::GatewayClient;

pub struct ApiTracker {
    gateway: GatewayClient,
    forwarder: Arc<dyn Forwarder>,
    /// Guest-side address the host forwards traffic to (tap interface IP).
    upstream_ip: String,
    is_admin: bool,
    storage: PortStorage,
    listeners: ListenerTracker,
}

impl ApiTracker {
    pub fn new(
        gateway: GatewayClient,
        forwarder: Arc<dyn Forwarder>,
        upstream_ip: String,
        is_admin: bool,
    ) -> Self {
        Self {
            gateway,
            forwarder,
            upstream_ip,
            is_admin,
            storage: PortStorage::new(),
            listeners: ListenerTracker::new(),
        }
    }

    /// Host IP actually used in expose/unexpose requests. Non-admin
    /// installs are forced onto 127.0.0.1, which a low-privilege process
    /// can bind without elevation, independent of the requested address.
    fn determine_host_ip<'a>(&self, host_ip: &'a str) -> &'a str {
        if self.is_admin {
            host_ip
        } else {
            "127.0.0.1"
        }
    }

    async fn unexpose_entries(&self, ports: &PortMap, errs: &mut Vec<String>) {
        for (key, bindings) in ports {
            for binding in bindings {
                if !is_ipv4(&binding.host_ip) {
                    debug!(binding = %binding.addr(), "skipping non-IPv4 binding on unexpose");
                    continue;
                }

                let request = UnexposeRequest {
                    local: format!(
                        "{}:{}",
                        self.determine_host_ip(&binding.host_ip),
                        binding.host_port
                    ),
                    protocol: key.protocol.as_str().to_string(),
                };

                if let Err(e) = self.gateway.unexpose(&request).await {
                    errs.push(format!("unexposing {} failed: {e}", binding.addr()));
                }
            }
        }
    }
}

#[async_trait]
impl Tracker for ApiTracker {
    async fn add(&self, container_id: &str, ports: PortMap) -> Result<(), TrackerError> {
        if ports.is_empty() {
            return Ok(());
        }

        let mut errs = Vec::new();
        let mut forwarded = PortMap::new();

        for (key, bindings) in &ports {
            let mut succeeded = Vec::new();

            for binding in bindings {
                if !is_ipv4(&binding.host_ip) {
                    warn!(binding = %binding.addr(), "skipping non-IPv4 binding on expose");
                    continue;
                }

                let request = ExposeRequest {
                    local: format!(
                        "{}:{}",
                        self.determine_host_ip(&binding.host_ip),
                        binding.host_port
                    ),
                    remote: format!("{}:{}", self.upstream_ip, binding.host_port),
                    protocol: key.protocol.as_str().to_string(),
                };

                match self.gateway.expose(&request).await {
                    Ok(()) => succeeded.push(binding.clone()),
                    Err(e) => errs.push(format!("exposing {} failed: {e}", binding.addr())),
                }
            }

            if !succeeded.is_empty() {
                forwarded.insert(*key, succeeded);
            }
        }

        // Storage tracks exactly what the host knows about, so the commit
        // covers only the successful subset, even when some bindings failed.
        self.storage.add(container_id, forwarded.clone());

        self.forwarder
            .send(PortMapping::add(forwarded, Vec::new()))
            .await?;

        if errs.is_empty() {
            Ok(())
        } else {
            Err(TrackerError::Expose(errs))
        }
    }

    async fn get(&self, container_id: &str) -> PortMap {
        self.storage.get(container_id)
    }

    async fn remove(&self, container_id: &str) -> Result<(), TrackerError> {
        let ports = self.storage.get(container_id);
        if ports.is_empty() {
            return Ok(());
        }

        let mut errs = Vec::new();
        self.unexpose_entries(&ports, &mut errs).await;

        // Deletion must not be blocked by unexpose failures; the remote
        // side tolerates redundant removes.
        self.storage.remove(container_id);

        self.forwarder
            .send(PortMapping::remove(ports, Vec::new()))
            .await?;

        if errs.is_empty() {
            Ok(())
        } else {
            Err(TrackerError::Unexpose(errs))
        }
    }

    async fn remove_all(&self) -> Result<(), TrackerError> {
        let mut errs = Vec::new();

        for (container_id, ports) in self.storage.get_all() {
            self.unexpose_entries(&ports, &mut errs).await;

            if let Err(e) = self
                .forwarder
                .send(PortMapping::remove(ports, Vec::new()))
                .await
            {
                errs.push(format!("notifying removal of {container_id} failed: {e}"));
            }
        }

        self.storage.remove_all();

        if errs.is_empty() {
            Ok(())
        } else {
            Err(TrackerError::RemoveAll(errs))
        }
    }

    async fn add_listener(&self, ip: IpAddr, port: u16) -> Result<(), TrackerError> {
        self.listeners.add_listener(ip, port).await
    }

    async fn remove_listener(&self, ip: IpAddr, port: u16) -> Result<(), TrackerError> {
        self.listeners.remove_listener(ip, port).await
    }
}

fn is_ipv4(addr: &str) -> bool {
    matches!(addr.parse::<IpAddr>(), Ok(IpAddr::V4(_)))
}
