//! Socket transports: one connection per notification, one JSON document
//! per connection.

use std::path::PathBuf;

use async_trait::async_trait;
use portbridge_portmap::PortMapping;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use super::{Forwarder, RETRY_DELAY, SEND_TIMEOUT};
use crate::error::ForwarderError;

/// Direct-socket transport: a fresh TCP connection per notification.
pub struct TcpForwarder {
    addr: String,
}

impl TcpForwarder {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    async fn attempt(&self, payload: &[u8]) -> Result<(), ForwarderError> {
        let run = async {
            let stream =
                TcpStream::connect(&self.addr)
                    .await
                    .map_err(|source| ForwarderError::Connect {
                        addr: self.addr.clone(),
                        source,
                    })?;
            write_payload(stream, payload, &self.addr).await
        };

        tokio::time::timeout(SEND_TIMEOUT, run)
            .await
            .map_err(|_| ForwarderError::Timeout {
                addr: self.addr.clone(),
            })?
    }
}

#[async_trait]
impl Forwarder for TcpForwarder {
    async fn send(&self, mapping: PortMapping) -> Result<(), ForwarderError> {
        let payload = serde_json::to_vec(&mapping)?;
        send_with_retry(|| self.attempt(&payload), &self.addr).await
    }
}

/// Local-proxy transport: a fresh unix-socket connection per notification.
pub struct UnixForwarder {
    path: PathBuf,
}

impl UnixForwarder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn addr(&self) -> String {
        self.path.display().to_string()
    }

    async fn attempt(&self, payload: &[u8]) -> Result<(), ForwarderError> {
        let run = async {
            let stream =
                UnixStream::connect(&self.path)
                    .await
                    .map_err(|source| ForwarderError::Connect {
                        addr: self.addr(),
                        source,
                    })?;
            write_payload(stream, payload, &self.addr()).await
        };

        tokio::time::timeout(SEND_TIMEOUT, run)
            .await
            .map_err(|_| ForwarderError::Timeout { addr: self.addr() })?
    }
}

#[async_trait]
impl Forwarder for UnixForwarder {
    async fn send(&self, mapping: PortMapping) -> Result<(), ForwarderError> {
        let payload = serde_json::to_vec(&mapping)?;
        send_with_retry(|| self.attempt(&payload), &self.addr()).await
    }
}

async fn write_payload<S>(mut stream: S, payload: &[u8], addr: &str) -> Result<(), ForwarderError>
where
    S: AsyncWrite + Unpin,
{
    let result = async {
        stream.write_all(payload).await?;
        stream.shutdown().await
    }
    .await;

    result.map_err(|source| ForwarderError::Send {
        addr: addr.to_string(),
        source,
    })
}

async fn send_with_retry<F, Fut>(mut attempt: F, addr: &str) -> Result<(), ForwarderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), ForwarderError>>,
{
    match attempt().await {
        Ok(()) => Ok(()),
        Err(first) => {
            debug!(addr, error = %first, "notification send failed, retrying once");
            tokio::time::sleep(RETRY_DELAY).await;
            attempt().await
        }
    }
}
