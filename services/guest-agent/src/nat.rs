//! iptables DNAT rule management.
//!
//! Container engines generate DNAT rules that only route loopback-bound
//! host ports from localhost. Traffic arriving over the tap network has a
//! non-local source, so each loopback binding gets one extra rule appended
//! after the engine's own rule, matching any destination address. The
//! helpers here build those rules for the DOCKER chain, the per-network
//! CNI chain, and the PREROUTING chain (host-network containers), and
//! remove them again when the owning container goes away.

use std::net::Ipv4Addr;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::NatError;

/// Chain names generated by the CNI portmap plugin are truncated to this
/// length, prefix included.
const MAX_CHAIN_LENGTH: usize = 28;
const CNI_DNAT_CHAIN_PREFIX: &str = "CNI-DN-";

/// Path of the CNI bridge network config inside the container's mount ns.
const NERDCTL_BRIDGE_CONFLIST: &str = "/etc/cni/net.d/nerdctl-bridge.conflist";

const ROUTE_LOCALNET_SYSCTL: &str = "/proc/sys/net/ipv4/conf/eth0/route_localnet";

/// Whether a PREROUTING rule is being added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Append,
    Delete,
}

impl RuleAction {
    fn flag(self) -> &'static str {
        match self {
            RuleAction::Append => "--append",
            RuleAction::Delete => "--delete",
        }
    }
}

/// A deletable loopback rule in the DOCKER chain, recorded when the rule
/// is appended so the exact same arguments can be replayed on removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerLoopbackRule {
    protocol: String,
    host_port: String,
    to_destination: String,
}

impl DockerLoopbackRule {
    pub fn new(protocol: &str, host_port: &str, to_destination: String) -> Self {
        Self {
            protocol: protocol.to_string(),
            host_port: host_port.to_string(),
            to_destination,
        }
    }

    /// Append the rule after the engine-generated one.
    pub async fn append(&self) -> Result<(), NatError> {
        run_iptables(&self.args("--append")).await
    }

    /// Delete the previously appended rule.
    pub async fn delete(&self) -> Result<(), NatError> {
        run_iptables(&self.args("--delete")).await
    }

    fn args(&self, action: &str) -> Vec<String> {
        vec![
            "--table".into(),
            "nat".into(),
            action.into(),
            "DOCKER".into(),
            "--protocol".into(),
            self.protocol.clone(),
            "--destination".into(),
            "0.0.0.0/0".into(),
            "--jump".into(),
            "DNAT".into(),
            "--dport".into(),
            self.host_port.clone(),
            "--to-destination".into(),
            self.to_destination.clone(),
        ]
    }
}

/// Delete the wildcard IPv6 DNAT rule Docker Compose creates alongside the
/// IPv4 one. The IPv6 rule matches any traffic for the port and, with no
/// IPv6 service behind it, resets connections, so it has to go before the
/// any-destination IPv4 rule is appended.
pub async fn delete_compose_ipv6_rule(
    protocol: &str,
    host_port: &str,
    container_port: u16,
) -> Result<(), NatError> {
    run_iptables(&[
        "--table".into(),
        "nat".into(),
        "--delete".into(),
        "DOCKER".into(),
        "--protocol".into(),
        protocol.to_string(),
        "--jump".into(),
        "DNAT".into(),
        "--dport".into(),
        host_port.to_string(),
        "--to-destination".into(),
        format!(":{container_port}"),
    ])
    .await
}

/// Append an any-destination DNAT rule to the per-network CNI chain.
pub async fn append_cni_loopback_rule(
    chain: &str,
    host_port: &str,
    to_destination: &str,
) -> Result<(), NatError> {
    run_iptables(&[
        "--table".into(),
        "nat".into(),
        "--append".into(),
        chain.to_string(),
        "--protocol".into(),
        "tcp".into(),
        "--destination".into(),
        "0.0.0.0/0".into(),
        "--jump".into(),
        "DNAT".into(),
        "--dport".into(),
        host_port.to_string(),
        "--to-destination".into(),
        to_destination.to_string(),
    ])
    .await
}

/// Append or delete a PREROUTING DNAT rule redirecting a loopback-bound
/// host port back to 127.0.0.1, required for host-network containers whose
/// services only listen on localhost.
pub async fn update_prerouting_loopback_rule(
    action: RuleAction,
    protocol: &str,
    host_port: &str,
) -> Result<(), NatError> {
    run_iptables(&[
        "--table".into(),
        "nat".into(),
        action.flag().into(),
        "PREROUTING".into(),
        "--protocol".into(),
        protocol.to_string(),
        "--dport".into(),
        host_port.to_string(),
        "--jump".into(),
        "DNAT".into(),
        "--to-destination".into(),
        format!("127.0.0.1:{host_port}"),
    ])
    .await
}

/// The chain the CNI portmap plugin created for this container's network:
/// `CNI-DN-` followed by a truncated sha512 of the network name plus the
/// namespaced container id.
pub fn cni_chain_name(network_name: &str, namespace: &str, container_id: &str) -> String {
    use sha2::{Digest, Sha512};

    let digest = Sha512::digest(format!("{network_name}{namespace}-{container_id}").as_bytes());
    let mut chain = format!("{CNI_DNAT_CHAIN_PREFIX}{}", hex::encode(digest));
    chain.truncate(MAX_CHAIN_LENGTH);
    chain
}

/// Name of the CNI bridge network a container is attached to, read from
/// the conflist inside the container's namespaces.
pub async fn read_cni_network_name(pid: u32) -> Result<String, NatError> {
    #[derive(Deserialize)]
    struct CniNetworkConfig {
        name: String,
    }

    let output = run_command(
        "nsenter",
        &[
            "-t".into(),
            pid.to_string(),
            "-n".into(),
            "cat".into(),
            NERDCTL_BRIDGE_CONFLIST.into(),
        ],
    )
    .await?;

    let config: CniNetworkConfig = serde_json::from_slice(&output)?;
    Ok(config.name)
}

/// IPv4 address of the eth0 interface inside the container's netns.
pub async fn container_eth0_ip(pid: u32) -> Result<Ipv4Addr, NatError> {
    let output = run_command(
        "nsenter",
        &[
            "-t".into(),
            pid.to_string(),
            "-n".into(),
            "ip".into(),
            "-o".into(),
            "-4".into(),
            "addr".into(),
            "show".into(),
            "dev".into(),
            "eth0".into(),
        ],
    )
    .await?;

    extract_eth0_ip(&String::from_utf8_lossy(&output)).ok_or(NatError::IpAddressNotFound { pid })
}

fn extract_eth0_ip(output: &str) -> Option<Ipv4Addr> {
    static INET_RE: OnceLock<Regex> = OnceLock::new();
    let re = INET_RE.get_or_init(|| {
        Regex::new(r"\binet\s+(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})/\d{1,2}")
            .expect("inet pattern is valid")
    });

    re.captures(output)?.get(1)?.as_str().parse().ok()
}

/// Enable route_localnet on eth0 so DNAT to 127.0.0.1 survives the
/// martian-source check.
pub fn enable_localnet_routing() -> Result<(), NatError> {
    std::fs::write(ROUTE_LOCALNET_SYSCTL, "1").map_err(|source| NatError::Sysctl {
        path: ROUTE_LOCALNET_SYSCTL.to_string(),
        source,
    })
}

async fn run_iptables(args: &[String]) -> Result<(), NatError> {
    run_command("iptables", args).await.map(|_| ())
}

async fn run_command(program: &str, args: &[String]) -> Result<Vec<u8>, NatError> {
    let rendered = format!("{program} {}", args.join(" "));
    debug!(command = %rendered, "running subprocess");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| NatError::Spawn {
            command: rendered.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(NatError::Exec {
            command: rendered,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cni_chain_name_is_truncated_with_prefix() {
        let chain = cni_chain_name("bridge", "default", "8b3bdbbbd8a1");
        assert!(chain.starts_with("CNI-DN-"));
        assert_eq!(chain.len(), MAX_CHAIN_LENGTH);
    }

    #[test]
    fn test_cni_chain_name_is_deterministic() {
        let a = cni_chain_name("bridge", "default", "abc");
        let b = cni_chain_name("bridge", "default", "abc");
        let c = cni_chain_name("bridge", "default", "abd");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_extract_eth0_ip() {
        let output = "2: eth0    inet 10.4.0.22/24 brd 10.4.0.255 scope global eth0\\       valid_lft forever preferred_lft forever";
        assert_eq!(extract_eth0_ip(output), Some(Ipv4Addr::new(10, 4, 0, 22)));
        assert_eq!(extract_eth0_ip("no address here"), None);
    }

    #[test]
    fn test_docker_loopback_rule_args() {
        let rule = DockerLoopbackRule::new("tcp", "9119", "10.4.0.22:80".to_string());
        let args = rule.args("--delete");
        assert!(args.contains(&"--delete".to_string()));
        assert!(args.contains(&"DOCKER".to_string()));
        assert!(args.contains(&"10.4.0.22:80".to_string()));
    }
}
