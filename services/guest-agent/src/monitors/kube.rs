//! Kubernetes Service watcher.
//!
//! Forwards NodePort and LoadBalancer service ports, keyed by Service UID.
//! The watcher is an explicit state machine:
//!
//! - `NoConfig` waits for the kubeconfig file to exist,
//! - `Disconnected` builds a client and probes the API server, retrying on
//!   connectivity errors that resolve themselves while k3s boots,
//! - `Watching` consumes the Service watch stream.
//!
//! Benign watch errors (expired resource versions, timeouts, EOF) are left
//! to the stream to heal; a refused connection rolls all the way back to
//! `NoConfig` after a short delay.
//!
//! In listener-only mode the watcher opens reservation listeners instead
//! of tracker entries, for topologies where a host-side mechanism picks up
//! occupied ports on its own.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::runtime::watcher;
use kube::{Api, Client};
use portbridge_portmap::{PortBinding, PortKey, PortMap, Protocol};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::tracker::Tracker;

const RETRY_DELAY: Duration = Duration::from_secs(1);

enum WatcherState {
    /// Kubeconfig has not been loaded yet.
    NoConfig,
    /// Kubeconfig loaded, not connected.
    Disconnected(Box<kube::Config>),
    Watching(Client),
}

pub struct KubeWatcher {
    kubeconfig_path: PathBuf,
    listener_ip: IpAddr,
    listener_only: bool,
    tracker: Arc<dyn Tracker>,
    /// Last applied map per Service UID, used to diff listener churn and
    /// to notice services that stop exposing node ports.
    known: HashMap<String, PortMap>,
}

impl KubeWatcher {
    pub fn new(
        kubeconfig_path: PathBuf,
        listener_ip: IpAddr,
        listener_only: bool,
        tracker: Arc<dyn Tracker>,
    ) -> Self {
        Self {
            kubeconfig_path,
            listener_ip,
            listener_only,
            tracker,
            known: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut state = WatcherState::NoConfig;

        loop {
            match state {
                WatcherState::NoConfig => match self.load_config().await {
                    Ok(Some(config)) => {
                        debug!(path = %self.kubeconfig_path.display(), "loaded kubeconfig");
                        state = WatcherState::Disconnected(Box::new(config));
                    }
                    Ok(None) => {
                        // Wait for the file to exist.
                        if wait_or_shutdown(&mut shutdown, RETRY_DELAY).await {
                            return Ok(());
                        }
                    }
                    Err(e) => return Err(e),
                },
                WatcherState::Disconnected(config) => {
                    let client = Client::try_from((*config).clone())
                        .context("failed to create Kubernetes client")?;

                    let probe = Api::<Service>::all(client.clone())
                        .list(&ListParams::default().limit(1))
                        .await;

                    match probe {
                        Ok(_) => {
                            debug!("watching kubernetes services");
                            state = WatcherState::Watching(client);
                        }
                        Err(e) if is_transient_connect_error(&e) => {
                            debug!(error = %e, "kubernetes API not reachable yet");
                            if wait_or_shutdown(&mut shutdown, RETRY_DELAY).await {
                                return Ok(());
                            }
                            state = WatcherState::Disconnected(config);
                        }
                        Err(e) => {
                            return Err(e).context("connecting to the Kubernetes API failed")
                        }
                    }
                }
                WatcherState::Watching(client) => {
                    match self.watch(client, &mut shutdown).await? {
                        WatchOutcome::Shutdown => return Ok(()),
                        WatchOutcome::Rollback => {
                            warn!("kubernetes watch failed, reloading configuration");
                            if wait_or_shutdown(&mut shutdown, RETRY_DELAY).await {
                                return Ok(());
                            }
                            state = WatcherState::NoConfig;
                        }
                    }
                }
            }
        }
    }

    /// Returns Ok(None) while the kubeconfig file does not exist yet;
    /// any other load failure is fatal.
    async fn load_config(&self) -> Result<Option<kube::Config>> {
        let kubeconfig = match Kubeconfig::read_from(&self.kubeconfig_path) {
            Ok(kubeconfig) => kubeconfig,
            Err(KubeconfigError::ReadConfig(e, _))
                if e.kind() == std::io::ErrorKind::NotFound =>
            {
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "could not load Kubernetes client config from {}",
                        self.kubeconfig_path.display()
                    )
                });
            }
        };

        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("invalid kubeconfig")?;

        Ok(Some(config))
    }

    async fn watch(
        &mut self,
        client: Client,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<WatchOutcome> {
        let services = Api::<Service>::all(client);
        let mut stream = Box::pin(watcher(services, watcher::Config::default()));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("kubernetes watcher received shutdown signal");
                    return Ok(WatchOutcome::Shutdown);
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(e)) => {
                        if is_refused_watch_error(&e) {
                            return Ok(WatchOutcome::Rollback);
                        }
                        // Expired resource versions, timeouts and closed
                        // watches heal on the next watch attempt.
                        debug!(error = %e, "kubernetes watch error, continuing");
                    }
                    None => return Ok(WatchOutcome::Rollback),
                },
            }
        }
    }

    async fn handle_event(&mut self, event: watcher::Event<Service>) {
        match event {
            watcher::Event::Applied(service) => self.apply_service(&service).await,
            watcher::Event::Deleted(service) => {
                let Some(uid) = service_uid(&service) else {
                    return;
                };
                self.remove_service(&uid).await;
            }
            watcher::Event::Restarted(services) => {
                // Full resync: drop services that disappeared while the
                // watch was down, then re-apply the rest.
                let live: Vec<String> =
                    services.iter().filter_map(service_uid).collect();
                let stale: Vec<String> = self
                    .known
                    .keys()
                    .filter(|uid| !live.contains(uid))
                    .cloned()
                    .collect();
                for uid in stale {
                    self.remove_service(&uid).await;
                }

                for service in &services {
                    self.apply_service(service).await;
                }
            }
        }
    }

    async fn apply_service(&mut self, service: &Service) {
        let Some(uid) = service_uid(service) else {
            warn!("kubernetes service without a UID");
            return;
        };
        let ports = service_port_map(service, self.listener_ip);

        if ports.is_empty() {
            // The service no longer exposes node ports.
            if self.known.contains_key(&uid) {
                self.remove_service(&uid).await;
            }
            return;
        }

        let previous = self.known.insert(uid.clone(), ports.clone());

        if self.listener_only {
            let old_ports = previous.unwrap_or_default();
            for key in old_ports.keys() {
                if !ports.contains_key(key) {
                    if let Err(e) = self.tracker.remove_listener(self.listener_ip, key.port).await
                    {
                        error!(port = key.port, error = %e, "failed to close listener");
                    }
                }
            }
            for key in ports.keys() {
                if let Err(e) = self.tracker.add_listener(self.listener_ip, key.port).await {
                    error!(port = key.port, error = %e, "failed to create listener");
                }
            }
            debug!(uid = %uid, ?ports, "kubernetes service listeners updated");
            return;
        }

        match self.tracker.add(&uid, ports.clone()).await {
            Ok(()) => debug!(uid = %uid, ?ports, "kubernetes service port mapping added"),
            Err(e) => error!(uid = %uid, error = %e, "failed to add port mapping"),
        }
    }

    async fn remove_service(&mut self, uid: &str) {
        let Some(ports) = self.known.remove(uid) else {
            return;
        };

        if self.listener_only {
            for key in ports.keys() {
                if let Err(e) = self.tracker.remove_listener(self.listener_ip, key.port).await {
                    error!(port = key.port, error = %e, "failed to close listener");
                }
            }
            debug!(uid = %uid, "kubernetes service listeners deleted");
            return;
        }

        match self.tracker.remove(uid).await {
            Ok(()) => debug!(uid = %uid, "kubernetes service port mapping deleted"),
            Err(e) => error!(uid = %uid, error = %e, "failed to delete port mapping"),
        }
    }
}

enum WatchOutcome {
    Shutdown,
    Rollback,
}

/// Sleep for the retry delay; true when shutdown arrived instead.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn service_uid(service: &Service) -> Option<String> {
    service.metadata.uid.clone()
}

/// Node ports of a NodePort or LoadBalancer service, bound to the
/// configured listener address.
fn service_port_map(service: &Service, listener_ip: IpAddr) -> PortMap {
    let mut map = PortMap::new();

    let Some(spec) = &service.spec else {
        return map;
    };
    if !matches!(spec.type_.as_deref(), Some("NodePort") | Some("LoadBalancer")) {
        return map;
    }

    for port in spec.ports.as_deref().unwrap_or_default() {
        let Some(node_port) = port.node_port else {
            continue;
        };
        let Ok(node_port) = u16::try_from(node_port) else {
            warn!(node_port, "kubernetes node port out of range");
            continue;
        };

        let protocol = match port.protocol.as_deref().unwrap_or("TCP").parse::<Protocol>() {
            Ok(protocol) => protocol,
            Err(_) => {
                warn!(protocol = ?port.protocol, "skipping unsupported service protocol");
                continue;
            }
        };

        map.entry(PortKey::new(node_port, protocol))
            .or_default()
            .push(PortBinding {
                host_ip: listener_ip.to_string(),
                host_port: node_port.to_string(),
            });
    }

    map
}

/// Errors expected while k3s is still coming up; retried, never surfaced.
fn is_transient_connect_error(err: &kube::Error) -> bool {
    let rendered = format!("{err:?}");
    rendered.contains("ConnectionRefused")
        || rendered.contains("Connection refused")
        || rendered.contains("NetworkUnreachable")
        || rendered.contains("Network is unreachable")
        || rendered.contains("timed out")
        || rendered.contains("apiserver not ready")
}

fn is_refused_watch_error(err: &watcher::Error) -> bool {
    format!("{err:?}").contains("Connection refused")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;

    fn node_port_service(type_: &str, node_ports: &[(i32, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                ports: Some(
                    node_ports
                        .iter()
                        .map(|(port, protocol)| ServicePort {
                            node_port: Some(*port),
                            protocol: Some(protocol.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }

    const LISTENER_IP: IpAddr = IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED);

    #[test]
    fn test_service_port_map_for_node_port_service() {
        let service = node_port_service("NodePort", &[(30080, "TCP"), (30053, "UDP")]);
        let map = service_port_map(&service, LISTENER_IP);

        assert_eq!(map.len(), 2);
        assert_eq!(
            map[&PortKey::tcp(30080)],
            vec![PortBinding::new("0.0.0.0", "30080")]
        );
        assert!(map.contains_key(&PortKey::udp(30053)));
    }

    #[test]
    fn test_service_port_map_ignores_cluster_ip_services() {
        let service = node_port_service("ClusterIP", &[(30080, "TCP")]);
        assert!(service_port_map(&service, LISTENER_IP).is_empty());
    }

    #[test]
    fn test_service_port_map_skips_ports_without_node_port() {
        let mut service = node_port_service("LoadBalancer", &[(30080, "TCP")]);
        if let Some(spec) = &mut service.spec {
            spec.ports.as_mut().unwrap().push(ServicePort {
                node_port: None,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }
        assert_eq!(service_port_map(&service, LISTENER_IP).len(), 1);
    }
}
