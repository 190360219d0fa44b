//! Reservation listeners.
//!
//! Some deployment topologies only need a port to be *occupied* on the
//! guest so an external port-forwarding mechanism picks it up; no data
//! flows through the agent. A reservation listener accepts and immediately
//! closes every connection, and is configured for address/port reuse plus
//! zero-linger close so rapid add/remove cycles never collide or block.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::TrackerError;

const BACKLOG: u32 = 128;

/// Tracks reservation listeners keyed by `"ip:port"`.
#[derive(Default)]
pub struct ListenerTracker {
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ListenerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a reservation listener for the given address.
    /// If the combination is already tracked, this is a no-op.
    pub async fn add_listener(&self, ip: IpAddr, port: u16) -> Result<(), TrackerError> {
        let addr = SocketAddr::new(ip, port);
        let key = addr.to_string();

        {
            let listeners = self.listeners.lock().expect("listener map lock poisoned");
            if listeners.contains_key(&key) {
                return Ok(());
            }
        }

        let listener = reservation_listener(addr).map_err(|source| TrackerError::Listener {
            addr: key.clone(),
            source,
        })?;

        let task = tokio::spawn(accept_and_discard(listener, key.clone()));
        self.listeners
            .lock()
            .expect("listener map lock poisoned")
            .insert(key, task);

        Ok(())
    }

    /// Close and stop tracking the listener for the given address.
    /// If the combination was not tracked, this is a no-op.
    pub async fn remove_listener(&self, ip: IpAddr, port: u16) -> Result<(), TrackerError> {
        let key = SocketAddr::new(ip, port).to_string();

        let task = self
            .listeners
            .lock()
            .expect("listener map lock poisoned")
            .remove(&key);

        if let Some(task) = task {
            // The accept loop owns the listener; aborting drops and closes it.
            task.abort();
            debug!(addr = %key, "closed reservation listener");
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn tracked_count(&self) -> usize {
        self.listeners.lock().expect("listener map lock poisoned").len()
    }
}

fn reservation_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    socket.set_reuseaddr(true)?;
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

/// Accept loop for a reservation listener: no traffic is ever handled, the
/// connection is closed with linger 0 and the other side gets to deal.
async fn accept_and_discard(listener: TcpListener, addr: String) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                if let Err(e) = stream.set_linger(Some(Duration::ZERO)) {
                    debug!(addr = %addr, error = %e, "failed to set linger on reservation connection");
                }
                drop(stream);
            }
            Err(e) => {
                error!(addr = %addr, error = %e, "reservation listener failed to accept");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_add_listener_is_idempotent() {
        let tracker = ListenerTracker::new();
        let port = free_port().await;

        tracker.add_listener(LOCALHOST, port).await.unwrap();
        tracker.add_listener(LOCALHOST, port).await.unwrap();

        assert_eq!(tracker.tracked_count(), 1);
    }

    #[tokio::test]
    async fn test_reservation_listener_closes_connections() {
        let tracker = ListenerTracker::new();
        let port = free_port().await;
        tracker.add_listener(LOCALHOST, port).await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 8];
        // Immediate close: read returns EOF or a reset error, never data.
        match stream.read(&mut buf).await {
            Ok(n) => assert_eq!(n, 0),
            Err(_) => {}
        }
    }

    #[tokio::test]
    async fn test_remove_untracked_listener_is_noop() {
        let tracker = ListenerTracker::new();
        tracker.remove_listener(LOCALHOST, 1).await.unwrap();
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_removed_listener_refuses_connections() {
        let tracker = ListenerTracker::new();
        let port = free_port().await;
        tracker.add_listener(LOCALHOST, port).await.unwrap();
        tracker.remove_listener(LOCALHOST, port).await.unwrap();

        // Give the abort a moment to drop the listener.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}
