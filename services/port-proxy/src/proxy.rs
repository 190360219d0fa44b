//! Notification-driven proxy core.
//!
//! Each inbound connection carries exactly one JSON port notification. An
//! add notification binds a local listener or socket per host binding and
//! starts relaying traffic to the same port on the upstream address; a
//! remove notification closes the matching listener or socket. Removes are
//! idempotent and a re-add replaces whatever was registered for the port.
//! Keys with a protocol the proxy does not serve are skipped per key, so
//! the rest of the message still applies.
//!
//! Shutdown order: the accept loop stops taking notifications, tracked
//! ports close, the inbound listener closes, then in-flight relays drain.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use portbridge_portmap::{PortBinding, PortKey, Protocol};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixListener};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Runtime settings for the proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the per-port relays dial, combined with the published port.
    pub upstream_address: String,
    /// Receive buffer size for UDP relays.
    pub udp_buffer_size: usize,
}

/// Notification body with the port keys left raw, so one key carrying a
/// protocol the proxy does not serve cannot reject the whole message.
#[derive(Debug, Deserialize)]
struct PortNotification {
    #[serde(default)]
    remove: bool,
    #[serde(default)]
    ports: BTreeMap<String, Vec<PortBinding>>,
}

/// Inbound transport for notification connections.
pub enum NotificationListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl NotificationListener {
    async fn accept(&self) -> io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        match self {
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Host-side proxy: one listener or socket per published port, all keyed
/// by port number. TCP and UDP registries are locked independently.
pub struct PortProxy {
    listener: NotificationListener,
    state: Arc<ProxyState>,
}

struct ProxyState {
    config: ProxyConfig,
    // Dropping a registered sender closes the matching port task.
    tcp_ports: Mutex<HashMap<u16, oneshot::Sender<()>>>,
    udp_ports: Mutex<HashMap<u16, oneshot::Sender<()>>>,
    relays: Mutex<Vec<JoinHandle<()>>>,
}

impl PortProxy {
    pub fn new(listener: NotificationListener, config: ProxyConfig) -> Self {
        Self {
            listener,
            state: Arc::new(ProxyState {
                config,
                tcp_ports: Mutex::new(HashMap::new()),
                udp_ports: Mutex::new(HashMap::new()),
                relays: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Accept notification connections until shutdown, then close every
    /// tracked port and wait for in-flight relays to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            upstream = %self.state.config.upstream_address,
            "proxy started accepting port notifications"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("proxy received shutdown signal");
                    break;
                }
                accepted = self.listener.accept() => {
                    let stream = accepted.context("accepting notification connection")?;
                    let state = Arc::clone(&self.state);
                    tokio::spawn(state.handle_notification(stream));
                }
            }
        }

        self.state.close_ports().await;
        drop(self.listener);
        self.state.drain_relays().await;

        info!("proxy shut down");
        Ok(())
    }
}

impl ProxyState {
    async fn handle_notification(self: Arc<Self>, mut stream: Box<dyn AsyncRead + Send + Unpin>) {
        let mut payload = Vec::new();
        if let Err(e) = stream.read_to_end(&mut payload).await {
            error!(error = %e, "failed to read notification payload");
            return;
        }

        let mapping: PortNotification = match serde_json::from_slice(&payload) {
            Ok(mapping) => mapping,
            Err(e) => {
                error!(error = %e, "failed to decode notification payload");
                return;
            }
        };

        debug!(
            remove = mapping.remove,
            ports = mapping.ports.len(),
            "received port notification"
        );

        for (raw_key, bindings) in &mapping.ports {
            let key: PortKey = match raw_key.parse() {
                Ok(key) => key,
                Err(e) => {
                    warn!(port = %raw_key, error = %e, "skipping unsupported port key");
                    continue;
                }
            };
            match key.protocol {
                Protocol::Tcp => Arc::clone(&self).handle_tcp(bindings, mapping.remove).await,
                Protocol::Udp => Arc::clone(&self).handle_udp(bindings, mapping.remove).await,
            }
        }
    }

    async fn handle_tcp(self: Arc<Self>, bindings: &[PortBinding], remove: bool) {
        for binding in bindings {
            let Some(port) = parse_host_port(binding) else {
                continue;
            };

            if remove {
                if self.tcp_ports.lock().await.remove(&port).is_some() {
                    debug!(port, "closing listener for removed port");
                }
                continue;
            }

            let addr = binding.addr();
            let listener = match TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(%addr, error = %e, "failed to bind listener for published port");
                    continue;
                }
            };

            let (closed_tx, closed_rx) = oneshot::channel();
            // A re-add drops the previous sender, closing the old loop.
            self.tcp_ports.lock().await.insert(port, closed_tx);
            debug!(%addr, "created listener for published port");

            let state = Arc::clone(&self);
            tokio::spawn(state.accept_tcp(listener, port, closed_rx));
        }
    }

    async fn accept_tcp(
        self: Arc<Self>,
        listener: TcpListener,
        port: u16,
        mut closed: oneshot::Receiver<()>,
    ) {
        let upstream = format!("{}:{}", self.config.upstream_address, port);

        loop {
            tokio::select! {
                _ = &mut closed => {
                    debug!(port, "listener closed");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((conn, peer)) => {
                            debug!(%peer, port, "accepted connection on published port");
                            let upstream = upstream.clone();
                            self.track_relay(tokio::spawn(relay_tcp(conn, upstream))).await;
                        }
                        Err(e) => {
                            error!(port, error = %e, "published port listener failed to accept");
                        }
                    }
                }
            }
        }
    }

    async fn handle_udp(self: Arc<Self>, bindings: &[PortBinding], remove: bool) {
        for binding in bindings {
            let Some(port) = parse_host_port(binding) else {
                continue;
            };

            if remove {
                if self.udp_ports.lock().await.remove(&port).is_some() {
                    debug!(port, "closing socket for removed port");
                }
                continue;
            }

            let addr = binding.addr();
            let socket = match UdpSocket::bind(&addr).await {
                Ok(socket) => socket,
                Err(e) => {
                    error!(%addr, error = %e, "failed to bind socket for published port");
                    continue;
                }
            };

            let (closed_tx, closed_rx) = oneshot::channel();
            self.udp_ports.lock().await.insert(port, closed_tx);
            debug!(%addr, "created socket for published port");

            let state = Arc::clone(&self);
            let relay = tokio::spawn(state.relay_udp(socket, port, closed_rx));
            self.track_relay(relay).await;
        }
    }

    /// Datagram relay: guest-bound traffic goes out a connected upstream
    /// socket, replies go back to the most recent peer.
    async fn relay_udp(
        self: Arc<Self>,
        socket: UdpSocket,
        port: u16,
        mut closed: oneshot::Receiver<()>,
    ) {
        let upstream_addr = format!("{}:{}", self.config.upstream_address, port);
        let upstream = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => {
                error!(port, error = %e, "failed to bind upstream relay socket");
                return;
            }
        };
        if let Err(e) = upstream.connect(&upstream_addr).await {
            error!(%upstream_addr, error = %e, "failed to connect upstream relay socket");
            return;
        }

        let mut inbound = vec![0u8; self.config.udp_buffer_size];
        let mut outbound = vec![0u8; self.config.udp_buffer_size];
        let mut last_peer: Option<SocketAddr> = None;

        loop {
            tokio::select! {
                _ = &mut closed => {
                    debug!(port, "socket closed");
                    return;
                }
                received = socket.recv_from(&mut inbound) => {
                    match received {
                        Ok((n, peer)) => {
                            last_peer = Some(peer);
                            if let Err(e) = upstream.send(&inbound[..n]).await {
                                error!(%upstream_addr, error = %e, "failed to forward datagram upstream");
                            }
                        }
                        Err(e) => {
                            error!(port, error = %e, "failed to receive on published port");
                            return;
                        }
                    }
                }
                replied = upstream.recv(&mut outbound) => {
                    match replied {
                        Ok(n) => {
                            if let Some(peer) = last_peer {
                                if let Err(e) = socket.send_to(&outbound[..n], peer).await {
                                    error!(%peer, error = %e, "failed to forward reply datagram");
                                }
                            }
                        }
                        Err(e) => {
                            // Connected UDP sockets surface ICMP errors here.
                            debug!(%upstream_addr, error = %e, "upstream receive failed");
                        }
                    }
                }
            }
        }
    }

    /// Register an in-flight relay, reaping handles that already finished
    /// so the registry stays bounded by the number of live relays.
    async fn track_relay(&self, handle: JoinHandle<()>) {
        let mut relays = self.relays.lock().await;
        relays.retain(|relay| !relay.is_finished());
        relays.push(handle);
    }

    async fn close_ports(&self) {
        self.tcp_ports.lock().await.clear();
        self.udp_ports.lock().await.clear();
    }

    async fn drain_relays(&self) {
        let relays: Vec<_> = self.relays.lock().await.drain(..).collect();
        debug!(count = relays.len(), "waiting for relays to finish");
        for relay in relays {
            let _ = relay.await;
        }
    }
}

async fn relay_tcp(mut conn: TcpStream, upstream: String) {
    let mut backend = match TcpStream::connect(&upstream).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(%upstream, error = %e, "failed to connect upstream");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut conn, &mut backend).await {
        Ok((sent, received)) => {
            debug!(%upstream, sent, received, "relay finished");
        }
        Err(e) => {
            debug!(%upstream, error = %e, "relay ended with error");
        }
    }
}

fn parse_host_port(binding: &PortBinding) -> Option<u16> {
    match binding.host_port.parse() {
        Ok(port) => Some(port),
        Err(e) => {
            error!(host_port = %binding.host_port, error = %e, "unparseable host port in notification");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(parse_host_port(&PortBinding::new("127.0.0.1", "9119")), Some(9119));
        assert_eq!(parse_host_port(&PortBinding::new("127.0.0.1", "ninety")), None);
        assert_eq!(parse_host_port(&PortBinding::new("127.0.0.1", "99999")), None);
    }

    #[test]
    fn test_notification_tolerates_unsupported_port_keys() {
        let raw = r#"{"remove":false,"ports":{"80/tcp":[],"53/sctp":[]}}"#;
        let mapping: PortNotification = serde_json::from_str(raw).unwrap();

        assert_eq!(mapping.ports.len(), 2);
        assert!("80/tcp".parse::<PortKey>().is_ok());
        assert!("53/sctp".parse::<PortKey>().is_err());
    }

    #[tokio::test]
    async fn test_track_relay_reaps_finished_handles() {
        let state = ProxyState {
            config: ProxyConfig {
                upstream_address: "127.0.0.1".to_string(),
                udp_buffer_size: 1024,
            },
            tcp_ports: Mutex::new(HashMap::new()),
            udp_ports: Mutex::new(HashMap::new()),
            relays: Mutex::new(Vec::new()),
        };

        for _ in 0..50 {
            let handle = tokio::spawn(async {});
            while !handle.is_finished() {
                tokio::task::yield_now().await;
            }
            state.track_relay(handle).await;
        }

        // Every handle above finished before the next insert, so only the
        // most recent one survives the reap.
        assert_eq!(state.relays.lock().await.len(), 1);
    }
}
