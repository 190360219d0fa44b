//! Event monitors.
//!
//! Each monitor watches one source of port-binding truth (Docker events,
//! containerd events, the Kubernetes Service API, iptables DNAT rules,
//! /proc/net) and translates what it sees into [`Tracker`] calls. Monitors
//! run as independent tasks, share nothing with each other, and treat a
//! bad event as log-and-continue so one malformed event never stops a
//! loop.
//!
//! [`Tracker`]: crate::tracker::Tracker

pub mod containerd;
pub mod docker;
pub mod iptables;
pub mod kube;
pub mod procnet;

use std::future::Future;
use std::path::Path;

use anyhow::{bail, Result};
use tracing::debug;

use crate::config::{ENGINE_POLL_INTERVAL, ENGINE_RETRY_BUDGET};

/// Synthetic container id for sources that have no engine-assigned id
/// (iptables rules, /proc/net entries): sha256 of the entry's canonical
/// string form.
pub(crate) fn generate_id(entry: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(entry.as_bytes()))
}

/// Wait for a container engine's control socket to appear and its API to
/// answer a health call. Polls on a fixed interval with an overall budget;
/// exhausting the budget is a fatal startup error for the owning monitor.
pub async fn wait_for_engine<F, Fut>(socket_path: &Path, verify: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut poll = tokio::time::interval(ENGINE_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let deadline = tokio::time::Instant::now() + ENGINE_RETRY_BUDGET;

    loop {
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "container engine at {} did not become ready within {:?}",
                socket_path.display(),
                ENGINE_RETRY_BUDGET
            );
        }

        poll.tick().await;
        debug!(socket = %socket_path.display(), "checking if container engine API is running");

        if !socket_path.exists() {
            continue;
        }

        match verify().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(error = %e, "container engine is not ready yet");
                continue;
            }
        }
    }
}
