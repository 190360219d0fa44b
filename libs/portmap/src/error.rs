//! Errors for parsing port keys.

use thiserror::Error;

/// Failure to parse a `"<port>/<protocol>"` key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortKeyError {
    /// Key is not of the form `<port>/<protocol>`.
    #[error("invalid port key format: {0}")]
    Format(String),

    /// Port segment is not a valid u16.
    #[error("invalid port number: {0}")]
    Port(String),

    /// Protocol segment is neither tcp nor udp.
    #[error("unsupported protocol: {0}")]
    Protocol(String),
}
