//! iptables DNAT scanner.
//!
//! Ports published through the CNI portmap plugin exist only as iptables
//! DNAT rules; they never show up in /proc/net and are invisible to the
//! other monitors. This scanner polls the NAT table on a fixed interval,
//! diffs the DNAT entries against the previous poll by `ip:port` identity,
//! and turns the difference into tracker calls. An iptables exit status of
//! 4 signals a resource conflict (another process holds the xtables lock)
//! and is retried on the next tick rather than treated as an error.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use portbridge_portmap::{PortBinding, PortKey, PortMap};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::generate_id;
use crate::config::IPTABLES_SCAN_INTERVAL;
use crate::tracker::Tracker;

/// xtables resource-problem exit code.
const EXIT_RESOURCE_PROBLEM: i32 = 4;

/// One DNAT rule, reduced to the destination identity used for diffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DnatEntry {
    ip: String,
    port: u16,
    tcp: bool,
}

impl DnatEntry {
    fn key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

pub struct IptablesScanner {
    tracker: Arc<dyn Tracker>,
}

impl IptablesScanner {
    pub fn new(tracker: Arc<dyn Tracker>) -> Self {
        Self { tracker }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(IPTABLES_SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut entries: Vec<DnatEntry> = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("iptables scanner received shutdown signal");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let new_entries = match scan_nat_table().await? {
                        Some(entries) => entries,
                        None => {
                            debug!("iptables exited with a resource error, retrying next tick");
                            continue;
                        }
                    };
                    debug!(count = new_entries.len(), "iptables scan found DNAT entries");

                    let (added, removed) = diff_entries(&entries, &new_entries);
                    entries = new_entries;

                    for entry in removed {
                        if let Err(e) = self.tracker.remove(&generate_id(&entry.key())).await {
                            warn!(entry = %entry.key(), error = %e,
                                "failed to remove iptables port mapping");
                        }
                    }

                    for entry in added {
                        if !entry.tcp {
                            continue;
                        }

                        // One binding per host port; the source address
                        // iptables reported is irrelevant, the tracker
                        // applies its own admin policy to 0.0.0.0.
                        let mut ports = PortMap::new();
                        ports.insert(
                            PortKey::tcp(entry.port),
                            vec![PortBinding::new("0.0.0.0", entry.port.to_string())],
                        );

                        match self.tracker.add(&generate_id(&entry.key()), ports).await {
                            Ok(()) => info!(entry = %entry.key(), "forwarding iptables port"),
                            Err(e) => error!(entry = %entry.key(), error = %e,
                                "failed to forward iptables port"),
                        }
                    }
                }
            }
        }
    }
}

/// Run `iptables -t nat -S` and parse the DNAT entries. Returns None on
/// the transient resource-problem exit code.
async fn scan_nat_table() -> Result<Option<Vec<DnatEntry>>> {
    let output = Command::new("iptables")
        .args(["--table", "nat", "-S"])
        .output()
        .await
        .context("running iptables failed")?;

    if !output.status.success() {
        if output.status.code() == Some(EXIT_RESOURCE_PROBLEM) {
            return Ok(None);
        }
        bail!(
            "iptables exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(Some(parse_dnat_rules(&String::from_utf8_lossy(
        &output.stdout,
    ))))
}

/// Extract DNAT entries from `iptables -S` output. A rule qualifies when
/// it jumps to DNAT and matches a destination port; the destination
/// address defaults to the wildcard when the rule has no `-d`.
fn parse_dnat_rules(output: &str) -> Vec<DnatEntry> {
    let mut entries = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();

        let mut protocol = None;
        let mut dest_ip = None;
        let mut dport = None;
        let mut is_dnat = false;

        let mut iter = fields.iter().peekable();
        while let Some(field) = iter.next() {
            match *field {
                "-p" | "--protocol" => protocol = iter.next().copied(),
                "-d" | "--destination" => dest_ip = iter.next().copied(),
                "--dport" => dport = iter.next().copied(),
                "-j" | "--jump" => is_dnat = iter.next().copied() == Some("DNAT"),
                _ => {}
            }
        }

        if !is_dnat {
            continue;
        }
        let Some(port) = dport.and_then(|p| p.parse::<u16>().ok()) else {
            continue;
        };

        let ip = dest_ip
            .map(|ip| ip.split('/').next().unwrap_or(ip).to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());

        entries.push(DnatEntry {
            ip,
            port,
            tcp: protocol == Some("tcp"),
        });
    }

    entries
}

/// Entries present only in `new` are added; entries present only in `old`
/// are removed; the intersection produces nothing.
fn diff_entries(old: &[DnatEntry], new: &[DnatEntry]) -> (Vec<DnatEntry>, Vec<DnatEntry>) {
    let old_keys: HashMap<String, &DnatEntry> =
        old.iter().map(|entry| (entry.key(), entry)).collect();
    let new_keys: HashMap<String, &DnatEntry> =
        new.iter().map(|entry| (entry.key(), entry)).collect();

    let added = new
        .iter()
        .filter(|entry| !old_keys.contains_key(&entry.key()))
        .cloned()
        .collect();
    let removed = old
        .iter()
        .filter(|entry| !new_keys.contains_key(&entry.key()))
        .cloned()
        .collect();

    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
-P PREROUTING ACCEPT
-A CNI-DN-5ce43d41696fd9143d873 -d 10.4.0.22/32 -p tcp --dport 9119 -j DNAT --to-destination 10.4.0.22:80
-A CNI-DN-5ce43d41696fd9143d873 -p udp --dport 5353 -j DNAT --to-destination 10.4.0.22:53
-A CNI-HOSTPORT-DNAT -m addrtype --dst-type LOCAL -j CNI-DN-5ce43d41696fd9143d873
-A POSTROUTING -s 10.4.0.0/24 -j MASQUERADE";

    #[test]
    fn test_parse_dnat_rules() {
        let entries = parse_dnat_rules(SAMPLE);
        assert_eq!(
            entries,
            vec![
                DnatEntry {
                    ip: "10.4.0.22".to_string(),
                    port: 9119,
                    tcp: true,
                },
                DnatEntry {
                    ip: "0.0.0.0".to_string(),
                    port: 5353,
                    tcp: false,
                },
            ]
        );
    }

    #[test]
    fn test_diff_entries() {
        let kept = DnatEntry {
            ip: "10.4.0.22".to_string(),
            port: 80,
            tcp: true,
        };
        let gone = DnatEntry {
            ip: "10.4.0.22".to_string(),
            port: 81,
            tcp: true,
        };
        let fresh = DnatEntry {
            ip: "10.4.0.23".to_string(),
            port: 82,
            tcp: true,
        };

        let (added, removed) = diff_entries(
            &[kept.clone(), gone.clone()],
            &[kept.clone(), fresh.clone()],
        );
        assert_eq!(added, vec![fresh]);
        assert_eq!(removed, vec![gone]);

        let (added, removed) = diff_entries(&[kept.clone()], &[kept]);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }
}
