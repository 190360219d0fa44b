//! Error types for the guest agent.

use thiserror::Error;

/// Failure to ship a notification across the guest/host boundary.
#[derive(Debug, Error)]
pub enum ForwarderError {
    /// Could not reach the remote end of the transport.
    #[error("connecting to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Connected but the write did not complete.
    #[error("sending notification to {addr} failed: {source}")]
    Send {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The send did not complete within the per-attempt budget.
    #[error("sending notification to {addr} timed out")]
    Timeout { addr: String },

    /// Notification could not be encoded.
    #[error("encoding port mapping failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Gateway API call failed at the HTTP layer.
    #[error("gateway request failed: {0}")]
    Gateway(#[from] reqwest::Error),

    /// Gateway returned a non-200 status; body is plain text.
    #[error("gateway returned {status}: {body}")]
    GatewayStatus { status: u16, body: String },
}

/// Failures while programming NAT rules or inspecting container netns state.
#[derive(Debug, Error)]
pub enum NatError {
    /// Subprocess could not be spawned or awaited.
    #[error("running {command} failed: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Subprocess ran but exited unsuccessfully; stderr captured.
    #[error("{command} exited with {status}: {stderr}")]
    Exec {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    /// Container CNI network config could not be decoded.
    #[error("decoding CNI network config failed: {0}")]
    NetworkConfig(#[from] serde_json::Error),

    /// No IPv4 address found on the container's eth0 interface.
    #[error("IP address not found for eth0 in pid {pid} netns")]
    IpAddressNotFound { pid: u32 },

    /// Kernel sysctl could not be written.
    #[error("writing sysctl {path} failed: {source}")]
    Sysctl {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Tracker-level failures, including per-binding aggregates.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Forward(#[from] ForwarderError),

    /// One or more bindings failed to expose; unaffected bindings were
    /// still forwarded and tracked.
    #[error("expose API errors: {0:?}")]
    Expose(Vec<String>),

    /// One or more bindings failed to unexpose; storage was still cleared.
    #[error("unexpose API errors: {0:?}")]
    Unexpose(Vec<String>),

    /// Errors collected while removing every tracked entry.
    #[error("failed to remove all port mappings: {0:?}")]
    RemoveAll(Vec<String>),

    /// Reservation listener could not be created.
    #[error("listener on {addr} failed: {source}")]
    Listener {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
