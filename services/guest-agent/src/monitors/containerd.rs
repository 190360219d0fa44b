//! containerd event monitor.
//!
//! Subscribes to `/tasks/start`, `/containers/update` and `/tasks/exit`.
//! Port data comes from the `nerdctl/ports` container label rather than an
//! inspect call. Update events only churn the tracker when the derived map
//! actually differs from the stored one, and exit events verify the task
//! is stopped before removing, guarding against stale or out-of-order
//! exits. Loopback-bound ports get an any-destination DNAT rule appended
//! to the per-network CNI chain, addressed at the container's eth0.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::{Context, Result};
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::events_client::EventsClient;
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::version_client::VersionClient;
use containerd_client::services::v1::{
    Envelope, GetContainerRequest, GetRequest, ListContainersRequest, SubscribeRequest,
};
use containerd_client::events::{ContainerUpdate, TaskExit, TaskStart};
use containerd_client::types::v1::Status as TaskStatus;
use containerd_client::with_namespace;
use portbridge_portmap::{PortBinding, PortKey, PortMap, Protocol};
use prost::Message;
use serde::Deserialize;
use tokio::sync::watch;
use tonic::transport::Channel;
use tonic::Request;
use tracing::{debug, error, warn};

use crate::nat;
use crate::tracker::Tracker;

const PORTS_LABEL: &str = "nerdctl/ports";
const DEFAULT_NAMESPACE: &str = "default";

const TOPIC_TASK_START: &str = "/tasks/start";
const TOPIC_CONTAINER_UPDATE: &str = "/containers/update";
const TOPIC_TASK_EXIT: &str = "/tasks/exit";

/// One entry of the `nerdctl/ports` label.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NerdctlPort {
    host_port: u16,
    container_port: u16,
    protocol: String,
    #[serde(rename = "HostIP")]
    host_ip: String,
}

pub struct ContainerdMonitor {
    channel: Channel,
    tracker: Arc<dyn Tracker>,
    /// Reservation listeners are only wanted when a privileged helper
    /// forwards ports on the host; otherwise they collide with the proxy
    /// listeners created through the gateway expose API.
    privileged_helper: bool,
}

impl ContainerdMonitor {
    pub async fn connect(
        sock: &str,
        tracker: Arc<dyn Tracker>,
        privileged_helper: bool,
    ) -> Result<Self> {
        let channel = containerd_client::connect(sock)
            .await
            .with_context(|| format!("connecting to containerd at {sock} failed"))?;

        Ok(Self {
            channel,
            tracker,
            privileged_helper,
        })
    }

    /// Health call used by the startup readiness poll.
    pub async fn is_serving(&self) -> Result<()> {
        VersionClient::new(self.channel.clone())
            .version(())
            .await
            .context("containerd API is not serving")?;
        Ok(())
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let request = SubscribeRequest {
            filters: vec![
                format!(r#"topic=="{TOPIC_TASK_START}""#),
                format!(r#"topic=="{TOPIC_CONTAINER_UPDATE}""#),
                format!(r#"topic=="{TOPIC_TASK_EXIT}""#),
            ],
        };

        let mut events = match EventsClient::new(self.channel.clone())
            .subscribe(request)
            .await
        {
            Ok(response) => response.into_inner(),
            Err(e) => {
                error!(error = %e, "subscribing to containerd events failed");
                return;
            }
        };

        if let Err(e) = self.initialize_running_containers().await {
            error!(error = %e, "failed to initialize existing container port mappings");
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("containerd monitor received shutdown signal");
                    break;
                }
                envelope = events.message() => match envelope {
                    Ok(Some(envelope)) => self.handle_event(envelope).await,
                    Ok(None) => {
                        warn!("containerd event stream ended");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "receiving container event failed");
                        break;
                    }
                },
            }
        }

        if let Err(e) = self.tracker.remove_all().await {
            error!(error = %e, "failed to remove all port mappings on shutdown");
        }
    }

    async fn handle_event(&self, envelope: Envelope) {
        debug!(topic = %envelope.topic, namespace = %envelope.namespace, "received an event");

        let Some(any) = envelope.event else {
            warn!(topic = %envelope.topic, "containerd event without a payload");
            return;
        };

        match envelope.topic.as_str() {
            TOPIC_TASK_START => match TaskStart::decode(any.value.as_slice()) {
                Ok(start) => self.handle_task_start(&envelope.namespace, start).await,
                Err(e) => error!(error = %e, "failed to decode task start event"),
            },
            TOPIC_CONTAINER_UPDATE => match ContainerUpdate::decode(any.value.as_slice()) {
                Ok(update) => self.handle_container_update(&envelope.namespace, update).await,
                Err(e) => error!(error = %e, "failed to decode container update event"),
            },
            TOPIC_TASK_EXIT => match TaskExit::decode(any.value.as_slice()) {
                Ok(exit) => self.handle_task_exit(&envelope.namespace, exit).await,
                Err(e) => error!(error = %e, "failed to decode task exit event"),
            },
            other => debug!(topic = other, "ignoring containerd event"),
        }
    }

    async fn handle_task_start(&self, namespace: &str, start: TaskStart) {
        let ports = match self.port_mapping_for(namespace, &start.container_id).await {
            Ok(ports) => ports,
            Err(e) => {
                error!(container_id = %start.container_id, error = %e,
                    "failed to create port mapping from task start event");
                return;
            }
        };
        if ports.is_empty() {
            return;
        }

        if let Err(e) =
            create_cni_loopback_rules(&ports, namespace, &start.container_id, start.pid).await
        {
            error!(container_id = %start.container_id, error = %e,
                "failed running iptables rules for the CNI DNAT chain");
        }

        if let Err(e) = self.tracker.add(&start.container_id, ports.clone()).await {
            error!(container_id = %start.container_id, error = %e,
                "adding port mapping to tracker failed");
            return;
        }

        self.add_listeners(&ports).await;
    }

    async fn handle_container_update(&self, namespace: &str, update: ContainerUpdate) {
        let ports = match self.port_mapping_for(namespace, &update.id).await {
            Ok(ports) => ports,
            Err(e) => {
                error!(container_id = %update.id, error = %e,
                    "failed to create port mapping from container update event");
                return;
            }
        };
        if ports.is_empty() {
            return;
        }

        let existing = self.tracker.get(&update.id).await;
        if existing.is_empty() {
            if let Err(e) = self.tracker.add(&update.id, ports).await {
                error!(container_id = %update.id, error = %e,
                    "adding port mapping from container update event failed");
            }
            return;
        }

        if ports == existing {
            return;
        }

        if let Err(e) = self.tracker.remove(&update.id).await {
            error!(container_id = %update.id, error = %e,
                "removing stale port mapping on container update failed");
        }
        self.remove_listeners(&existing).await;

        if let Err(e) = self.tracker.add(&update.id, ports.clone()).await {
            error!(container_id = %update.id, error = %e,
                "adding port mapping from container update event failed");
            return;
        }
        self.add_listeners(&ports).await;
    }

    async fn handle_task_exit(&self, namespace: &str, exit: TaskExit) {
        // Exit events can arrive stale or out of order; only remove when
        // the task really is stopped (or gone entirely).
        match self.task_status(namespace, &exit.container_id).await {
            Ok(Some(status)) if status != TaskStatus::Stopped => {
                debug!(container_id = %exit.container_id, ?status,
                    "ignoring exit event for task that is not stopped");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(container_id = %exit.container_id, error = %e,
                    "task status lookup failed, treating task as stopped");
            }
        }

        let ports = self.tracker.get(&exit.container_id).await;
        if !ports.is_empty() {
            if let Err(e) = self.tracker.remove(&exit.container_id).await {
                error!(container_id = %exit.container_id, error = %e,
                    "removing port mapping from tracker failed");
            }
        }

        self.remove_listeners(&ports).await;
    }

    /// Backup pass for containers whose start events were missed during
    /// agent startup.
    async fn initialize_running_containers(&self) -> Result<()> {
        let request = ListContainersRequest { filters: vec![] };
        let request = with_namespace!(request, DEFAULT_NAMESPACE);
        let containers = ContainersClient::new(self.channel.clone())
            .list(request)
            .await
            .context("listing containers failed")?
            .into_inner()
            .containers;

        for container in containers {
            if !self.tracker.get(&container.id).await.is_empty() {
                continue;
            }

            let (pid, status) = match self.task_process(DEFAULT_NAMESPACE, &container.id).await {
                Ok(Some(process)) => process,
                Ok(None) => continue,
                Err(e) => {
                    debug!(container_id = %container.id, error = %e,
                        "failed getting container task");
                    continue;
                }
            };
            if status != TaskStatus::Running {
                continue;
            }

            let ports = match port_mapping_from_label(
                container.labels.get(PORTS_LABEL).map(String::as_str),
            ) {
                Ok(ports) => ports,
                Err(e) => {
                    error!(container_id = %container.id, error = %e,
                        "failed to create port mapping for running container");
                    continue;
                }
            };
            if ports.is_empty() {
                continue;
            }

            if let Err(e) =
                create_cni_loopback_rules(&ports, DEFAULT_NAMESPACE, &container.id, pid).await
            {
                error!(container_id = %container.id, error = %e,
                    "failed running iptables rules for the CNI DNAT chain");
            }

            if let Err(e) = self.tracker.add(&container.id, ports.clone()).await {
                error!(container_id = %container.id, error = %e,
                    "adding port mapping to tracker failed");
                continue;
            }

            self.add_listeners(&ports).await;
            debug!(container_id = %container.id, ?ports, "initialized running container");
        }

        Ok(())
    }

    async fn port_mapping_for(&self, namespace: &str, container_id: &str) -> Result<PortMap> {
        let request = GetContainerRequest {
            id: container_id.to_string(),
        };
        let request = with_namespace!(request, namespace);

        let container = ContainersClient::new(self.channel.clone())
            .get(request)
            .await
            .context("container lookup failed")?
            .into_inner()
            .container
            .context("container lookup returned no container")?;

        port_mapping_from_label(container.labels.get(PORTS_LABEL).map(String::as_str))
    }

    async fn task_status(
        &self,
        namespace: &str,
        container_id: &str,
    ) -> Result<Option<TaskStatus>> {
        Ok(self
            .task_process(namespace, container_id)
            .await?
            .map(|(_, status)| status))
    }

    /// Pid and status of the container's task, or None when the task is
    /// already gone.
    async fn task_process(
        &self,
        namespace: &str,
        container_id: &str,
    ) -> Result<Option<(u32, TaskStatus)>> {
        let request = GetRequest {
            container_id: container_id.to_string(),
            exec_id: String::new(),
        };
        let request = with_namespace!(request, namespace);

        let response = match TasksClient::new(self.channel.clone()).get(request).await {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == tonic::Code::NotFound => return Ok(None),
            Err(status) => return Err(status).context("task lookup failed"),
        };

        Ok(response.process.map(|process| {
            let status =
                TaskStatus::try_from(process.status).unwrap_or(TaskStatus::Unknown);
            (process.pid, status)
        }))
    }

    async fn add_listeners(&self, ports: &PortMap) {
        self.update_listeners(ports, true).await;
    }

    async fn remove_listeners(&self, ports: &PortMap) {
        self.update_listeners(ports, false).await;
    }

    async fn update_listeners(&self, ports: &PortMap, add: bool) {
        if !self.privileged_helper {
            return;
        }

        for bindings in ports.values() {
            for binding in bindings {
                let Ok(port) = binding.host_port.parse::<u16>() else {
                    error!(binding = %binding.addr(), "host port is not numeric");
                    continue;
                };

                // Listeners must bind INADDR_ANY; any other address ends up
                // in iptables as a non-routable entry.
                let ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
                let result = if add {
                    self.tracker.add_listener(ip, port).await
                } else {
                    self.tracker.remove_listener(ip, port).await
                };

                if let Err(e) = result {
                    error!(port, error = %e, "updating reservation listener failed");
                }
            }
        }
    }
}

/// Decode the `nerdctl/ports` label into a port map. A missing or empty
/// label yields an empty map.
fn port_mapping_from_label(label: Option<&str>) -> Result<PortMap> {
    let mut map = PortMap::new();

    let Some(label) = label else {
        return Ok(map);
    };
    if label.is_empty() {
        return Ok(map);
    }

    let ports: Vec<NerdctlPort> =
        serde_json::from_str(label).context("decoding nerdctl/ports label failed")?;

    for port in ports {
        let protocol: Protocol = port
            .protocol
            .parse()
            .with_context(|| format!("unsupported protocol {:?}", port.protocol))?;
        let key = PortKey::new(port.container_port, protocol);

        map.entry(key).or_default().push(PortBinding {
            host_ip: port.host_ip,
            host_port: port.host_port.to_string(),
        });
    }

    Ok(map)
}

/// Append an any-destination DNAT rule to the container's CNI chain for
/// every loopback binding.
async fn create_cni_loopback_rules(
    ports: &PortMap,
    namespace: &str,
    container_id: &str,
    pid: u32,
) -> Result<()> {
    let loopback_bindings: Vec<_> = ports
        .iter()
        .flat_map(|(key, bindings)| bindings.iter().map(move |binding| (key, binding)))
        .filter(|(_, binding)| binding.host_ip == "127.0.0.1")
        .collect();
    if loopback_bindings.is_empty() {
        return Ok(());
    }

    let network_name = nat::read_cni_network_name(pid).await?;
    let eth0_ip = nat::container_eth0_ip(pid).await?;
    let chain = nat::cni_chain_name(&network_name, namespace, container_id);

    debug!(container_id, chain = %chain, ip = %eth0_ip, "determined CNI DNAT chain");

    let mut errs = Vec::new();
    for (key, binding) in loopback_bindings {
        if let Err(e) =
            nat::append_cni_loopback_rule(&chain, &binding.host_port, &format!("{eth0_ip}:{}", key.port))
                .await
        {
            errs.push(e.to_string());
        }
    }

    if errs.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("creating loopback rules in {chain} failed: {errs:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_mapping_from_label() {
        let label = r#"[
            {"HostPort": 8080, "ContainerPort": 80, "Protocol": "tcp", "HostIP": "0.0.0.0"},
            {"HostPort": 8081, "ContainerPort": 80, "Protocol": "tcp", "HostIP": "127.0.0.1"},
            {"HostPort": 5353, "ContainerPort": 53, "Protocol": "udp", "HostIP": "0.0.0.0"}
        ]"#;

        let map = port_mapping_from_label(Some(label)).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&PortKey::tcp(80)].len(), 2);
        assert_eq!(map[&PortKey::udp(53)][0].host_port, "5353");
    }

    #[test]
    fn test_port_mapping_from_missing_label_is_empty() {
        assert!(port_mapping_from_label(None).unwrap().is_empty());
        assert!(port_mapping_from_label(Some("")).unwrap().is_empty());
    }

    #[test]
    fn test_port_mapping_from_label_rejects_bad_json() {
        assert!(port_mapping_from_label(Some("not json")).is_err());
    }
}
