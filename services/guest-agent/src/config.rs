//! Agent configuration.
//!
//! Flags mirror the deployment topologies the agent runs under: which
//! container engine to watch, whether Kubernetes service forwarding is on,
//! which transport carries notifications to the host, and whether the
//! install is privileged.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use portbridge_portmap::ConnectAddrs;

/// Poll interval for the iptables DNAT scanner.
pub const IPTABLES_SCAN_INTERVAL: Duration = Duration::from_secs(3);

/// Poll interval for the /proc/net scanner.
pub const PROCNET_SCAN_INTERVAL: Duration = Duration::from_secs(3);

/// Poll interval while waiting for a container engine socket.
pub const ENGINE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Overall budget for the engine to come up before startup fails.
pub const ENGINE_RETRY_BUDGET: Duration = Duration::from_secs(120);

#[derive(Debug, Parser)]
#[command(
    name = "guest-agent",
    about = "Synchronizes container and Kubernetes port bindings to the host"
)]
pub struct Cli {
    /// Display debug output.
    #[arg(long)]
    pub debug: bool,

    /// Enable Docker event monitoring.
    #[arg(long)]
    pub docker: bool,

    /// Enable containerd event monitoring.
    #[arg(long)]
    pub containerd: bool,

    /// Path to the containerd socket.
    #[arg(long, default_value = "/run/k3s/containerd/containerd.sock")]
    pub containerd_sock: String,

    /// Enable Kubernetes service forwarding.
    #[arg(long)]
    pub kubernetes: bool,

    /// Path to the kubeconfig file.
    #[arg(long, default_value = "/etc/rancher/k3s/k3s.yaml")]
    pub kubeconfig: PathBuf,

    /// Address to bind Kubernetes services to on the host;
    /// valid options are 0.0.0.0 or 127.0.0.1.
    #[arg(long, default_value = "0.0.0.0")]
    pub k8s_service_listener_addr: IpAddr,

    /// Kubernetes API port forwarded to the host as a static mapping.
    #[arg(long, default_value_t = 6443)]
    pub k8s_api_port: u16,

    /// Whether the product is installed with administrative privileges.
    #[arg(long)]
    pub admin_install: bool,

    /// Whether a privileged helper runs on the host; enables reservation
    /// listeners instead of gateway exposure for Kubernetes services.
    #[arg(long)]
    pub privileged_helper: bool,

    /// Notification transport: unix:<path> or tcp:<addr>.
    #[arg(long, default_value = "unix:/run/host-proxy.sock")]
    pub forwarder: String,

    /// Gateway base URL for the expose/unexpose API; selects the API
    /// tracker when set (namespaced network).
    #[arg(long, env = "PORTBRIDGE_GATEWAY_URL")]
    pub gateway_url: Option<String>,

    /// IP address of the tap interface (eth0) in the network namespace.
    #[arg(long, default_value = "192.168.127.2")]
    pub tap_iface_ip: Ipv4Addr,
}

/// Notification transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwarderAddr {
    Unix(PathBuf),
    Tcp(String),
}

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,
    pub docker: bool,
    pub containerd: bool,
    pub containerd_sock: String,
    pub kubernetes: bool,
    pub kubeconfig: PathBuf,
    pub k8s_service_listener_addr: IpAddr,
    pub k8s_api_port: u16,
    pub admin_install: bool,
    pub privileged_helper: bool,
    pub forwarder: ForwarderAddr,
    pub gateway_url: Option<String>,
    pub tap_iface_ip: Ipv4Addr,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if !cli.docker && !cli.containerd {
            bail!("requires either --docker or --containerd enabled");
        }
        if cli.docker && cli.containerd {
            bail!("requires either --docker or --containerd but not both");
        }

        let wildcard = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        if cli.k8s_service_listener_addr != wildcard && cli.k8s_service_listener_addr != loopback {
            bail!(
                "invalid Kubernetes service listener address {}; valid options are 0.0.0.0 and 127.0.0.1",
                cli.k8s_service_listener_addr
            );
        }

        let forwarder = parse_forwarder_addr(&cli.forwarder)
            .with_context(|| format!("invalid --forwarder value {:?}", cli.forwarder))?;

        Ok(Self {
            debug: cli.debug,
            docker: cli.docker,
            containerd: cli.containerd,
            containerd_sock: cli.containerd_sock,
            kubernetes: cli.kubernetes,
            kubeconfig: cli.kubeconfig,
            k8s_service_listener_addr: cli.k8s_service_listener_addr,
            k8s_api_port: cli.k8s_api_port,
            admin_install: cli.admin_install,
            privileged_helper: cli.privileged_helper,
            forwarder,
            gateway_url: cli.gateway_url,
            tap_iface_ip: cli.tap_iface_ip,
        })
    }

    /// Backend addresses carried in notifications so the host side knows
    /// how to reach the guest.
    pub fn connect_addrs(&self) -> Vec<ConnectAddrs> {
        vec![ConnectAddrs::new("tcp", self.tap_iface_ip.to_string())]
    }
}

fn parse_forwarder_addr(raw: &str) -> Result<ForwarderAddr> {
    match raw.split_once(':') {
        Some(("unix", path)) if !path.is_empty() => Ok(ForwarderAddr::Unix(PathBuf::from(path))),
        Some(("tcp", addr)) if !addr.is_empty() => Ok(ForwarderAddr::Tcp(addr.to_string())),
        _ => bail!("expected unix:<path> or tcp:<addr>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli::parse_from(["guest-agent", "--docker"])
    }

    #[test]
    fn test_requires_exactly_one_engine() {
        let neither = Cli::parse_from(["guest-agent"]);
        assert!(Config::from_cli(neither).is_err());

        let both = Cli::parse_from(["guest-agent", "--docker", "--containerd"]);
        assert!(Config::from_cli(both).is_err());

        assert!(Config::from_cli(base_cli()).is_ok());
    }

    #[test]
    fn test_k8s_listener_addr_restricted() {
        let mut cli = base_cli();
        cli.k8s_service_listener_addr = "192.168.1.5".parse().unwrap();
        assert!(Config::from_cli(cli).is_err());

        let mut cli = base_cli();
        cli.k8s_service_listener_addr = "127.0.0.1".parse().unwrap();
        assert!(Config::from_cli(cli).is_ok());
    }

    #[test]
    fn test_forwarder_addr_parsing() {
        assert_eq!(
            parse_forwarder_addr("unix:/run/host-proxy.sock").unwrap(),
            ForwarderAddr::Unix(PathBuf::from("/run/host-proxy.sock"))
        );
        assert_eq!(
            parse_forwarder_addr("tcp:192.168.127.1:6443").unwrap(),
            ForwarderAddr::Tcp("192.168.127.1:6443".to_string())
        );
        assert!(parse_forwarder_addr("vsock:3").is_err());
        assert!(parse_forwarder_addr("unix:").is_err());
    }
}
