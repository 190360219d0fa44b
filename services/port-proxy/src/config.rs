//! Proxy configuration.
//!
//! The proxy needs very little: where to accept notifications, which
//! address the relays forward to, and how large UDP receive buffers are.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

/// Largest payload a UDP datagram can carry.
pub const DEFAULT_UDP_BUFFER_SIZE: usize = 65507;

#[derive(Debug, Parser)]
#[command(
    name = "port-proxy",
    about = "Host-side listening surface for published guest ports"
)]
pub struct Cli {
    /// Display debug output.
    #[arg(long)]
    pub debug: bool,

    /// Notification endpoint to accept on: unix:<path> or tcp:<addr>.
    #[arg(long, default_value = "unix:/run/host-proxy.sock")]
    pub listen: String,

    /// Guest address the relays forward to, combined with each published
    /// port.
    #[arg(long, default_value = "192.168.127.2")]
    pub upstream_address: String,

    /// Receive buffer size for UDP relays, in bytes.
    #[arg(long, default_value_t = DEFAULT_UDP_BUFFER_SIZE)]
    pub udp_buffer_size: usize,
}

/// Notification endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Unix(PathBuf),
    Tcp(String),
}

pub fn parse_listen_addr(raw: &str) -> Result<ListenAddr> {
    match raw.split_once(':') {
        Some(("unix", path)) if !path.is_empty() => Ok(ListenAddr::Unix(PathBuf::from(path))),
        Some(("tcp", addr)) if !addr.is_empty() => Ok(ListenAddr::Tcp(addr.to_string())),
        _ => bail!("expected unix:<path> or tcp:<addr>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_addr_parsing() {
        assert_eq!(
            parse_listen_addr("unix:/run/host-proxy.sock").unwrap(),
            ListenAddr::Unix(PathBuf::from("/run/host-proxy.sock"))
        );
        assert_eq!(
            parse_listen_addr("tcp:127.0.0.1:6443").unwrap(),
            ListenAddr::Tcp("127.0.0.1:6443".to_string())
        );
        assert!(parse_listen_addr("vsock:3").is_err());
        assert!(parse_listen_addr("tcp:").is_err());
    }
}
