//! Docker engine event monitor.
//!
//! Subscribes to the engine event stream filtered to container start, stop
//! and die. On start the container is inspected and its published bindings
//! handed to the tracker; on stop or die the entry is removed. A catch-up
//! pass over already-running containers covers events missed before the
//! monitor attached. Loopback-bound ports additionally get an
//! any-destination DNAT rule in the DOCKER chain so they stay reachable
//! from the bridged network; the matching delete command is recorded per
//! container and replayed on stop or die.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerSummary, PortTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::StreamExt;
use portbridge_portmap::{PortBinding, PortKey, PortMap};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::nat::{self, DockerLoopbackRule};
use crate::tracker::Tracker;

pub struct DockerMonitor {
    docker: Docker,
    tracker: Arc<dyn Tracker>,
    /// Per-container delete commands for loopback rules added to the
    /// DOCKER chain, replayed when the container stops.
    cleanup_rules: HashMap<String, Vec<DockerLoopbackRule>>,
}

impl DockerMonitor {
    pub fn new(tracker: Arc<dyn Tracker>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("connecting to the Docker engine failed")?;

        Ok(Self {
            docker,
            tracker,
            cleanup_rules: HashMap::new(),
        })
    }

    /// Health call used by the startup readiness poll.
    pub async fn is_serving(&self) -> Result<()> {
        self.docker
            .info()
            .await
            .context("docker engine info call failed")?;
        Ok(())
    }

    /// Consume the event stream until shutdown or stream end, then flush
    /// every tracked mapping.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let docker = self.docker.clone();
        let mut events = docker.events(Some(EventsOptions::<String> {
            filters: HashMap::from([
                ("type".to_string(), vec!["container".to_string()]),
                (
                    "event".to_string(),
                    vec!["start".to_string(), "stop".to_string(), "die".to_string()],
                ),
            ]),
            ..Default::default()
        }));

        if let Err(e) = self.initialize_running_containers().await {
            error!(error = %e, "failed to initialize existing container port mappings");
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("docker monitor received shutdown signal");
                    break;
                }
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        let action = event.action.as_deref().unwrap_or_default().to_string();
                        let Some(id) = event.actor.and_then(|actor| actor.id) else {
                            warn!("docker event without a container id");
                            continue;
                        };

                        match action.as_str() {
                            "start" => self.handle_start(&id).await,
                            "stop" | "die" => self.handle_stop(&id).await,
                            other => debug!(action = other, "ignoring docker event"),
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "receiving container event failed");
                        break;
                    }
                    None => {
                        warn!("docker event stream ended");
                        break;
                    }
                },
            }
        }

        self.flush().await;
    }

    async fn handle_start(&mut self, container_id: &str) {
        let container = match self.docker.inspect_container(container_id, None).await {
            Ok(container) => container,
            Err(e) => {
                error!(container_id, error = %e, "inspecting container failed");
                return;
            }
        };

        let settings = container.network_settings.unwrap_or_default();
        let ports = settings
            .ports
            .as_ref()
            .map(port_map_from_inspect)
            .unwrap_or_default();
        if ports.is_empty() {
            return;
        }

        debug!(container_id, ?ports, "container started with published ports");

        if let Err(e) = self.tracker.add(container_id, ports.clone()).await {
            error!(container_id, error = %e, "adding port mapping to tracker failed");
        }

        // Containers attached to named networks (compose) carry per-network
        // addresses; plain containers expose one top-level address.
        let networks = settings.networks.unwrap_or_default();
        if !networks.is_empty() {
            if let Err(e) = delete_compose_ipv6_rules(&ports).await {
                error!(container_id, error = %e,
                    "removing docker compose IPv6 rule from DOCKER chain failed");
            }
            for (network_name, endpoint) in networks {
                let container_ip = endpoint.ip_address.unwrap_or_default();
                self.create_loopback_rules(container_id, &container_ip, &ports)
                    .await
                    .unwrap_or_else(|e| {
                        error!(container_id, network = %network_name, error = %e,
                            "creating DNAT rule in DOCKER chain failed");
                    });
            }
        } else {
            let container_ip = settings.ip_address.unwrap_or_default();
            if let Err(e) = self
                .create_loopback_rules(container_id, &container_ip, &ports)
                .await
            {
                error!(container_id, error = %e, "creating DNAT rule in DOCKER chain failed");
            }
        }
    }

    async fn handle_stop(&mut self, container_id: &str) {
        if let Err(e) = self.tracker.remove(container_id).await {
            error!(container_id, error = %e, "removing port mapping from tracker failed");
        }

        if let Some(rules) = self.cleanup_rules.remove(container_id) {
            for rule in rules {
                debug!(container_id, ?rule, "removing loopback rule from DOCKER chain");
                if let Err(e) = rule.delete().await {
                    error!(container_id, error = %e, "deleting loopback rule failed");
                }
            }
        }
    }

    /// Catch-up pass over containers already running when the monitor
    /// attached.
    async fn initialize_running_containers(&mut self) -> Result<()> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                filters: HashMap::from([(
                    "status".to_string(),
                    vec!["running".to_string()],
                )]),
                ..Default::default()
            }))
            .await
            .context("listing running containers failed")?;

        for container in containers {
            let Some(id) = container.id.clone() else {
                continue;
            };

            let ports = port_map_from_summary(&container);
            if ports.is_empty() {
                continue;
            }

            if let Err(e) = self.tracker.add(&id, ports.clone()).await {
                error!(container_id = %id, error = %e,
                    "registering already running container failed");
                continue;
            }

            let networks = container
                .network_settings
                .and_then(|settings| settings.networks)
                .unwrap_or_default();
            for endpoint in networks.into_values() {
                let container_ip = endpoint.ip_address.unwrap_or_default();
                if let Err(e) = self.create_loopback_rules(&id, &container_ip, &ports).await {
                    error!(container_id = %id, error = %e,
                        "creating DNAT rule during container initialization failed");
                }
            }

            info!(container_id = %id, "initialized already running container");
        }

        Ok(())
    }

    /// Append an any-destination DNAT rule per loopback binding and record
    /// the matching delete command for the container.
    async fn create_loopback_rules(
        &mut self,
        container_id: &str,
        container_ip: &str,
        ports: &PortMap,
    ) -> Result<()> {
        let mut errs = Vec::new();

        for (key, bindings) in ports {
            for binding in bindings {
                if binding.host_ip != "127.0.0.1" {
                    continue;
                }

                let rule = DockerLoopbackRule::new(
                    key.protocol.as_str(),
                    &binding.host_port,
                    format!("{container_ip}:{}", key.port),
                );

                if let Err(e) = rule.append().await {
                    errs.push(e.to_string());
                }

                self.cleanup_rules
                    .entry(container_id.to_string())
                    .or_default()
                    .push(rule);
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("creating loopback rules in DOCKER chain failed: {errs:?}")
        }
    }

    /// Clear all tracked mappings on shutdown.
    async fn flush(&self) {
        if let Err(e) = self.tracker.remove_all().await {
            error!(error = %e, "failed to remove all port mappings on shutdown");
        }
    }
}

/// Convert the engine's inspect port map, dropping keys whose binding list
/// is missing or empty.
fn port_map_from_inspect(ports: &bollard::models::PortMap) -> PortMap {
    let mut map = PortMap::new();

    for (key, bindings) in ports {
        let Ok(key) = key.parse::<PortKey>() else {
            warn!(port = %key, "skipping unparseable port key from inspect");
            continue;
        };

        let Some(bindings) = bindings else {
            continue;
        };
        if bindings.is_empty() {
            continue;
        }

        let bindings = bindings
            .iter()
            .map(|binding| PortBinding {
                host_ip: normalize_host_ip(binding.host_ip.as_deref().unwrap_or_default()),
                host_port: binding.host_port.clone().unwrap_or_default(),
            })
            .collect();

        map.insert(key, bindings);
    }

    map
}

/// Convert a container summary's flat port list into a port map, skipping
/// entries with no public binding.
fn port_map_from_summary(container: &ContainerSummary) -> PortMap {
    let mut map = PortMap::new();

    for port in container.ports.as_deref().unwrap_or_default() {
        let ip = port.ip.clone().unwrap_or_default();
        let Some(public_port) = port.public_port else {
            continue;
        };
        if ip.is_empty() || public_port == 0 {
            continue;
        }

        let key = match port.typ {
            Some(PortTypeEnum::TCP) | None => PortKey::tcp(port.private_port as u16),
            Some(PortTypeEnum::UDP) => PortKey::udp(port.private_port as u16),
            Some(other) => {
                debug!(protocol = ?other, "skipping unsupported protocol in container summary");
                continue;
            }
        };

        map.entry(key).or_default().push(PortBinding {
            host_ip: normalize_host_ip(&ip),
            host_port: public_port.to_string(),
        });
    }

    map
}

async fn delete_compose_ipv6_rules(ports: &PortMap) -> Result<()> {
    let mut errs = Vec::new();

    for (key, bindings) in ports {
        for binding in bindings {
            if binding.host_ip != "127.0.0.1" {
                continue;
            }
            if let Err(e) =
                nat::delete_compose_ipv6_rule(key.protocol.as_str(), &binding.host_port, key.port)
                    .await
            {
                errs.push(e.to_string());
            }
        }
    }

    if errs.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("deleting compose IPv6 rules failed: {errs:?}")
    }
}

/// The engine reports loopback and wildcard addresses literally but may
/// also hand back an empty or IPv6-wildcard host IP; both normalize to
/// INADDR_ANY so downstream trackers can apply their own policy.
fn normalize_host_ip(ip: &str) -> String {
    if ip.is_empty() || ip == "::" {
        "0.0.0.0".to_string()
    } else {
        ip.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::Port;

    #[test]
    fn test_port_map_from_inspect_strips_empty_binding_lists() {
        let ports = bollard::models::PortMap::from([
            (
                "80/tcp".to_string(),
                Some(vec![bollard::models::PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some("8080".to_string()),
                }]),
            ),
            ("9000/tcp".to_string(), Some(vec![])),
            ("9001/udp".to_string(), None),
        ]);

        let map = port_map_from_inspect(&ports);
        assert_eq!(map.len(), 1);
        let bindings = &map[&PortKey::tcp(80)];
        assert_eq!(bindings[0].host_port, "8080");
    }

    #[test]
    fn test_port_map_from_summary_skips_unpublished_ports() {
        let container = ContainerSummary {
            ports: Some(vec![
                Port {
                    ip: Some("0.0.0.0".to_string()),
                    private_port: 80,
                    public_port: Some(8080),
                    typ: Some(PortTypeEnum::TCP),
                },
                Port {
                    ip: None,
                    private_port: 81,
                    public_port: Some(8081),
                    typ: Some(PortTypeEnum::TCP),
                },
                Port {
                    ip: Some("0.0.0.0".to_string()),
                    private_port: 82,
                    public_port: None,
                    typ: Some(PortTypeEnum::TCP),
                },
            ]),
            ..Default::default()
        };

        let map = port_map_from_summary(&container);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&PortKey::tcp(80)));
    }

    #[test]
    fn test_normalize_host_ip() {
        assert_eq!(normalize_host_ip(""), "0.0.0.0");
        assert_eq!(normalize_host_ip("::"), "0.0.0.0");
        assert_eq!(normalize_host_ip("127.0.0.1"), "127.0.0.1");
        assert_eq!(normalize_host_ip("192.168.1.5"), "192.168.1.5");
    }
}
