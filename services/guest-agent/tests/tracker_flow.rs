//! End-to-end tracker behavior over real sockets and a mock gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use portbridge_guest_agent::error::TrackerError;
use portbridge_guest_agent::forwarder::TcpForwarder;
use portbridge_guest_agent::gateway::{GatewayClient, EXPOSE_API, UNEXPOSE_API};
use portbridge_guest_agent::tracker::{ApiTracker, SocketTracker, Tracker};
use portbridge_portmap::{ConnectAddrs, PortBinding, PortKey, PortMap, PortMapping};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// TCP listener that decodes every received connection as one JSON
/// notification and hands it to the test.
async fn recording_listener() -> (SocketAddr, mpsc::UnboundedReceiver<PortMapping>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if stream.read_to_end(&mut buf).await.is_ok() {
                    if let Ok(mapping) = serde_json::from_slice::<PortMapping>(&buf) {
                        let _ = tx.send(mapping);
                    }
                }
            });
        }
    });

    (addr, rx)
}

fn single_binding_map(port: u16, host_ip: &str, host_port: &str) -> PortMap {
    let mut map = PortMap::new();
    map.insert(PortKey::tcp(port), vec![PortBinding::new(host_ip, host_port)]);
    map
}

fn socket_tracker(addr: SocketAddr) -> SocketTracker {
    SocketTracker::new(
        Arc::new(TcpForwarder::new(addr.to_string())),
        vec![ConnectAddrs::new("tcp", "192.168.127.2")],
    )
}

async fn expect_message(rx: &mut mpsc::UnboundedReceiver<PortMapping>) -> PortMapping {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a notification")
        .expect("notification channel closed")
}

#[tokio::test]
async fn test_socket_tracker_add_sends_one_add_notification() {
    let (addr, mut rx) = recording_listener().await;
    let tracker = socket_tracker(addr);
    let ports = single_binding_map(80, "127.0.0.1", "80");

    tracker.add("c1", ports.clone()).await.unwrap();

    let message = expect_message(&mut rx).await;
    assert!(!message.remove);
    assert_eq!(message.ports, ports);
    assert_eq!(
        message.connect_addrs,
        vec![ConnectAddrs::new("tcp", "192.168.127.2")]
    );

    assert_eq!(tracker.get("c1").await, ports);
}

#[tokio::test]
async fn test_socket_tracker_remove_sends_one_remove_notification() {
    let (addr, mut rx) = recording_listener().await;
    let tracker = socket_tracker(addr);
    let ports = single_binding_map(80, "127.0.0.1", "80");

    tracker.add("c1", ports.clone()).await.unwrap();
    expect_message(&mut rx).await;

    tracker.remove("c1").await.unwrap();

    let message = expect_message(&mut rx).await;
    assert!(message.remove);
    assert_eq!(message.ports, ports);

    assert!(tracker.get("c1").await.is_empty());
}

#[tokio::test]
async fn test_add_with_empty_map_is_a_noop() {
    let (addr, mut rx) = recording_listener().await;
    let tracker = socket_tracker(addr);
    let ports = single_binding_map(80, "127.0.0.1", "80");

    tracker.add("c1", ports.clone()).await.unwrap();
    expect_message(&mut rx).await;

    tracker.add("c1", PortMap::new()).await.unwrap();

    // Prior state stays and nothing further was forwarded.
    assert_eq!(tracker.get("c1").await, ports);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_remove_untracked_id_makes_no_network_call() {
    let (addr, mut rx) = recording_listener().await;
    let tracker = socket_tracker(addr);

    tracker.remove("ghost").await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_remove_all_clears_every_tracked_id() {
    let (addr, mut rx) = recording_listener().await;
    let tracker = socket_tracker(addr);

    tracker
        .add("c1", single_binding_map(80, "0.0.0.0", "8080"))
        .await
        .unwrap();
    tracker
        .add("c2", single_binding_map(81, "0.0.0.0", "8081"))
        .await
        .unwrap();
    expect_message(&mut rx).await;
    expect_message(&mut rx).await;

    tracker.remove_all().await.unwrap();

    let first = expect_message(&mut rx).await;
    let second = expect_message(&mut rx).await;
    assert!(first.remove && second.remove);

    assert!(tracker.get("c1").await.is_empty());
    assert!(tracker.get("c2").await.is_empty());
}

#[tokio::test]
async fn test_api_tracker_commits_only_the_successful_subset() {
    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(EXPOSE_API))
        .and(body_json(serde_json::json!({
            "local": "0.0.0.0:8080",
            "remote": "192.168.127.2:8080",
            "protocol": "tcp",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&gateway)
        .await;
    Mock::given(method("POST"))
        .and(path(EXPOSE_API))
        .and(body_json(serde_json::json!({
            "local": "0.0.0.0:8081",
            "remote": "192.168.127.2:8081",
            "protocol": "tcp",
        })))
        .respond_with(ResponseTemplate::new(500).set_body_string("EOF"))
        .expect(1)
        .mount(&gateway)
        .await;

    let (addr, mut rx) = recording_listener().await;
    let tracker = ApiTracker::new(
        GatewayClient::new(gateway.uri()),
        Arc::new(TcpForwarder::new(addr.to_string())),
        "192.168.127.2".to_string(),
        true,
    );

    let mut ports = PortMap::new();
    ports.insert(
        PortKey::tcp(80),
        vec![
            PortBinding::new("0.0.0.0", "8080"),
            PortBinding::new("0.0.0.0", "8081"),
        ],
    );

    let err = tracker.add("c1", ports).await.unwrap_err();
    match err {
        TrackerError::Expose(errs) => {
            assert_eq!(errs.len(), 1);
            assert!(errs[0].contains("0.0.0.0:8081"), "error was: {}", errs[0]);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Storage and the proxy notification carry exactly the survivor.
    let expected = single_binding_map(80, "0.0.0.0", "8080");
    assert_eq!(tracker.get("c1").await, expected);

    let message = expect_message(&mut rx).await;
    assert!(!message.remove);
    assert_eq!(message.ports, expected);
}

#[tokio::test]
async fn test_api_tracker_forces_loopback_for_non_admin_installs() {
    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(EXPOSE_API))
        .and(body_json(serde_json::json!({
            "local": "127.0.0.1:8080",
            "remote": "192.168.127.2:8080",
            "protocol": "tcp",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&gateway)
        .await;

    let (addr, _rx) = recording_listener().await;
    let tracker = ApiTracker::new(
        GatewayClient::new(gateway.uri()),
        Arc::new(TcpForwarder::new(addr.to_string())),
        "192.168.127.2".to_string(),
        false,
    );

    tracker
        .add("c1", single_binding_map(80, "0.0.0.0", "8080"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_api_tracker_remove_unexposes_and_clears() {
    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(EXPOSE_API))
        .respond_with(ResponseTemplate::new(200))
        .mount(&gateway)
        .await;
    Mock::given(method("POST"))
        .and(path(UNEXPOSE_API))
        .and(body_json(serde_json::json!({
            "local": "0.0.0.0:8080",
            "protocol": "tcp",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&gateway)
        .await;

    let (addr, _rx) = recording_listener().await;
    let tracker = ApiTracker::new(
        GatewayClient::new(gateway.uri()),
        Arc::new(TcpForwarder::new(addr.to_string())),
        "192.168.127.2".to_string(),
        true,
    );

    tracker
        .add("c1", single_binding_map(80, "0.0.0.0", "8080"))
        .await
        .unwrap();
    tracker.remove("c1").await.unwrap();

    assert!(tracker.get("c1").await.is_empty());
}
