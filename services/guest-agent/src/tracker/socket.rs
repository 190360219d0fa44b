//! Tracker variant for topologies with a privileged helper on the host.
//!
//! The helper does the actual port binding, so this variant only ships
//! whole-map notifications over the socket transport. State is committed
//! after a successful send; a failed send fails the call atomically and
//! leaves storage untouched.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use portbridge_portmap::{ConnectAddrs, PortMap, PortMapping};

use super::listeners::ListenerTracker;
use super::storage::PortStorage;
use super::Tracker;
use crate::error::TrackerError;
use crate::forwarder::Forwarder;

pub struct SocketTracker {
    storage: PortStorage,
    forwarder: Arc<dyn Forwarder>,
    connect_addrs: Vec<ConnectAddrs>,
    listeners: ListenerTracker,
}

impl SocketTracker {
    pub fn new(forwarder: Arc<dyn Forwarder>, connect_addrs: Vec<ConnectAddrs>) -> Self {
        Self {
            storage: PortStorage::new(),
            forwarder,
            connect_addrs,
            listeners: ListenerTracker::new(),
        }
    }
}

#[async_trait]
impl Tracker for SocketTracker {
    async fn add(&self, container_id: &str, ports: PortMap) -> Result<(), TrackerError> {
        if ports.is_empty() {
            return Ok(());
        }

        self.forwarder
            .send(PortMapping::add(ports.clone(), self.connect_addrs.clone()))
            .await?;

        self.storage.add(container_id, ports);

        Ok(())
    }

    async fn get(&self, container_id: &str) -> PortMap {
        self.storage.get(container_id)
    }

    async fn remove(&self, container_id: &str) -> Result<(), TrackerError> {
        let ports = self.storage.get(container_id);
        if ports.is_empty() {
            return Ok(());
        }

        self.forwarder
            .send(PortMapping::remove(ports, self.connect_addrs.clone()))
            .await?;

        self.storage.remove(container_id);

        Ok(())
    }

    async fn remove_all(&self) -> Result<(), TrackerError> {
        let mut errs = Vec::new();

        for (container_id, ports) in self.storage.get_all() {
            if let Err(e) = self
                .forwarder
                .send(PortMapping::remove(ports, self.connect_addrs.clone()))
                .await
            {
                errs.push(format!("removing {container_id} failed: {e}"));
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
