//! /proc/net scanner.
//!
//! Catches ports that no engine event ever announces, such as services in
//! host-network containers. Parses /proc/net/{tcp,tcp6,udp,udp6} on a
//! fixed interval, keeps TCP sockets in LISTEN and bound UDP sockets, and
//! diffs the snapshot against the previous one by port key. Bind addresses
//! other than loopback or the wildcard are normalized to 0.0.0.0 since
//! nothing else is reachable from the host; the tracker substitutes its
//! own admin policy downstream. Loopback-bound ports additionally get a
//! PREROUTING DNAT rule so traffic from outside the namespace still
//! reaches 127.0.0.1, which also requires the route_localnet sysctl.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use anyhow::Result;
use portbridge_portmap::{PortBinding, PortKey, PortMap, Protocol};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::generate_id;
use crate::config::PROCNET_SCAN_INTERVAL;
use crate::error::NatError;
use crate::nat::{self, RuleAction};
use crate::tracker::Tracker;

/// TCP_LISTEN in /proc/net/tcp.
const TCP_LISTEN: u8 = 0x0A;
/// State of a bound, unconnected UDP socket (TCP_CLOSE on the wire).
const UDP_BOUND: u8 = 0x07;

const PROC_NET_FILES: [(&str, Protocol); 4] = [
    ("/proc/net/tcp", Protocol::Tcp),
    ("/proc/net/tcp6", Protocol::Tcp),
    ("/proc/net/udp", Protocol::Udp),
    ("/proc/net/udp6", Protocol::Udp),
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct SocketEntry {
    protocol: Protocol,
    ip: IpAddr,
    port: u16,
}

pub struct ProcNetScanner {
    tracker: Arc<dyn Tracker>,
}

impl ProcNetScanner {
    /// Enables localnet routing on construction; without it the kernel
    /// drops DNAT'ed traffic to 127.0.0.1 as martian.
    pub fn new(tracker: Arc<dyn Tracker>) -> Result<Self, NatError> {
        nat::enable_localnet_routing()?;
        info!("enabled route_localnet for loopback port forwarding");
        Ok(Self { tracker })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(PROCNET_SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut previous = PortMap::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("/proc/net scanner received shutdown signal");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let snapshot = match scan_proc_net().await {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            error!(error = %e, "failed to parse /proc/net files");
                            continue;
                        }
                    };

                    let (added, removed) = diff_snapshots(&previous, &snapshot);

                    for (key, bindings) in &added {
                        info!(port = %key, ?bindings, "/proc/net scanner added port");

                        let mut ports = PortMap::new();
                        ports.insert(*key, bindings.clone());
                        if let Err(e) = self.tracker.add(&generate_id(&key.to_string()), ports).await {
                            error!(port = %key, error = %e, "/proc/net scanner failed to add port");
                            continue;
                        }

                        self.update_loopback_rules(key, bindings, RuleAction::Append).await;
                    }

                    for (key, bindings) in &removed {
                        info!(port = %key, "/proc/net scanner removed port");

                        if let Err(e) = self.tracker.remove(&generate_id(&key.to_string())).await {
                            error!(port = %key, error = %e, "/proc/net scanner failed to remove port");
                            continue;
                        }

                        self.update_loopback_rules(key, bindings, RuleAction::Delete).await;
                    }

                    previous = snapshot;
                }
            }
        }
    }

    async fn update_loopback_rules(&self, key: &PortKey, bindings: &[PortBinding], action: RuleAction) {
        for binding in bindings {
            if binding.host_ip != "127.0.0.1" {
                continue;
            }
            if let Err(e) = nat::update_prerouting_loopback_rule(
                action,
                key.protocol.as_str(),
                &binding.host_port,
            )
            .await
            {
                error!(port = %key, ?action, error = %e,
                    "updating PREROUTING loopback rule failed");
            }
        }
    }
}

async fn scan_proc_net() -> Result<PortMap> {
    let mut map = PortMap::new();

    for (path, protocol) in PROC_NET_FILES {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            // tcp6/udp6 are absent on kernels without IPv6.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).map_err(Into::into),
        };

        for entry in parse_entries(&content, protocol) {
            add_entry(&mut map, &entry);
        }
    }

    Ok(map)
}

/// Parse one /proc/net table, keeping only listening TCP and bound UDP
/// sockets. Malformed lines are skipped.
fn parse_entries(content: &str, protocol: Protocol) -> Vec<SocketEntry> {
    let wanted_state = match protocol {
        Protocol::Tcp => TCP_LISTEN,
        Protocol::Udp => UDP_BOUND,
    };

    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }

            let state = u8::from_str_radix(fields[3], 16).ok()?;
            if state != wanted_state {
                return None;
            }

            let (ip, port) = parse_local_address(fields[1])?;
            Some(SocketEntry { protocol, ip, port })
        })
        .collect()
}

/// Decode the `local_address` column: hex IP (little-endian per 32-bit
/// word) and hex port.
fn parse_local_address(raw: &str) -> Option<(IpAddr, u16)> {
    let (ip_hex, port_hex) = raw.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    let ip = match ip_hex.len() {
        8 => {
            let word = u32::from_str_radix(ip_hex, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.swap_bytes()))
        }
        32 => {
            let mut bytes = [0u8; 16];
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = u8::from_str_radix(&ip_hex[i * 2..i * 2 + 2], 16).ok()?;
            }
            // Each 32-bit word is stored little-endian.
            for chunk in bytes.chunks_exact_mut(4) {
                chunk.reverse();
            }
            IpAddr::V6(Ipv6Addr::from(bytes))
        }
        _ => return None,
    };

    Some((ip, port))
}

/// Keys present in `current` but not `previous` were added; keys present
/// in `previous` but not `current` vanished. Binding changes under an
/// existing key do not churn the tracker.
fn diff_snapshots(previous: &PortMap, current: &PortMap) -> (PortMap, PortMap) {
    let added = current
        .iter()
        .filter(|(key, _)| !previous.contains_key(key))
        .map(|(key, bindings)| (*key, bindings.clone()))
        .collect();
    let removed = previous
        .iter()
        .filter(|(key, _)| !current.contains_key(key))
        .map(|(key, bindings)| (*key, bindings.clone()))
        .collect();

    (added, removed)
}

fn add_entry(map: &mut PortMap, entry: &SocketEntry) {
    // Only loopback and the wildcard are reachable from the host as-is;
    // everything else normalizes to 0.0.0.0 and the tracker substitutes
    // 127.0.0.1 for non-admin installs.
    let host_ip = if entry.ip.is_loopback() || entry.ip == IpAddr::V4(Ipv4Addr::UNSPECIFIED) {
        entry.ip.to_string()
    } else {
        Ipv4Addr::UNSPECIFIED.to_string()
    };

    let binding = PortBinding::new(host_ip, entry.port.to_string());
    let bindings = map
        .entry(PortKey::new(entry.port, entry.protocol))
        .or_default();
    // v4 and v6 tables often carry the same socket; keep one binding.
    if !bindings.contains(&binding) {
        bindings.push(binding);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP_SAMPLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0
   1: 00000000:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0
   2: 1600A8C0:0016 00000000:0000 01 00000000:00000000 00:00000000 00000000     0";

    const UDP_SAMPLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid
  10: 0A04000A:14E9 00000000:0000 07 00000000:00000000 00:00000000 00000000     0
  11: 00000000:0044 00000000:0000 01 00000000:00000000 00:00000000 00000000     0";

    #[test]
    fn test_parse_entries_keeps_listening_tcp_only() {
        let entries = parse_entries(TCP_SAMPLE, Protocol::Tcp);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(entries[0].port, 8080);
        assert_eq!(entries[1].ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(entries[1].port, 80);
    }

    #[test]
    fn test_parse_entries_keeps_bound_udp_only() {
        let entries = parse_entries(UDP_SAMPLE, Protocol::Udp);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ip, IpAddr::V4(Ipv4Addr::new(10, 0, 4, 10)));
        assert_eq!(entries[0].port, 5353);
    }

    #[test]
    fn test_parse_local_address_ipv6() {
        let (ip, port) = parse_local_address("00000000000000000000000001000000:1F90").unwrap();
        assert_eq!(ip, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(port, 8080);
    }

    #[test]
    fn test_diff_snapshots_reports_new_and_vanished_keys() {
        let binding = |port: u16| vec![PortBinding::new("0.0.0.0", port.to_string())];

        let mut previous = PortMap::new();
        previous.insert(PortKey::tcp(80), binding(80));
        previous.insert(PortKey::udp(53), binding(53));

        let mut current = PortMap::new();
        current.insert(PortKey::tcp(80), binding(80));
        current.insert(PortKey::tcp(8080), binding(8080));

        let (added, removed) = diff_snapshots(&previous, &current);

        assert_eq!(added.len(), 1);
        assert!(added.contains_key(&PortKey::tcp(8080)));
        assert_eq!(removed.len(), 1);
        assert!(removed.contains_key(&PortKey::udp(53)));
    }

    #[test]
    fn test_diff_snapshots_ignores_binding_changes_under_a_kept_key() {
        let mut previous = PortMap::new();
        previous.insert(PortKey::tcp(80), vec![PortBinding::new("127.0.0.1", "80")]);

        let mut current = PortMap::new();
        current.insert(PortKey::tcp(80), vec![PortBinding::new("0.0.0.0", "80")]);

        let (added, removed) = diff_snapshots(&previous, &current);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn test_add_entry_normalizes_non_local_addresses() {
        let mut map = PortMap::new();
        add_entry(
            &mut map,
            &SocketEntry {
                protocol: Protocol::Tcp,
                ip: "192.168.1.5".parse().unwrap(),
                port: 80,
            },
        );

        assert_eq!(map[&PortKey::tcp(80)][0].host_ip, "0.0.0.0");
    }

    #[test]
    fn test_add_entry_keeps_loopback_and_deduplicates() {
        let mut map = PortMap::new();
        let entry = SocketEntry {
            protocol: Protocol::Tcp,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
        };
        add_entry(&mut map, &entry);
        add_entry(&mut map, &entry);

        let bindings = &map[&PortKey::tcp(8080)];
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].host_ip, "127.0.0.1");
    }
}
