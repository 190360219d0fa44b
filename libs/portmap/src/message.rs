//! Wire messages exchanged across the guest/host boundary.

use serde::{Deserialize, Serialize};

use crate::types::PortMap;

/// Backend network address carried alongside a notification, telling the
/// remote side how to reach the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectAddrs {
    #[serde(rename = "network")]
    pub network: String,
    #[serde(rename = "addr")]
    pub addr: String,
}

impl ConnectAddrs {
    pub fn new(network: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            addr: addr.into(),
        }
    }
}

/// A single "these bindings were added/removed" notification.
///
/// Socket transports ship exactly one of these, JSON-encoded, per
/// connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(rename = "remove")]
    pub remove: bool,
    #[serde(rename = "ports")]
    pub ports: PortMap,
    #[serde(rename = "connectAddrs", default)]
    pub connect_addrs: Vec<ConnectAddrs>,
}

impl PortMapping {
    /// Notification that the given bindings were added.
    pub fn add(ports: PortMap, connect_addrs: Vec<ConnectAddrs>) -> Self {
        Self {
            remove: false,
            ports,
            connect_addrs,
        }
    }

    /// Notification that the given bindings were removed.
    pub fn remove(ports: PortMap, connect_addrs: Vec<ConnectAddrs>) -> Self {
        Self {
            remove: true,
            ports,
            connect_addrs,
        }
    }
}

/// Body of `POST /services/forwarder/expose` on the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposeRequest {
    /// `"ip:port"` to listen on, host side.
    pub local: String,
    /// `"ip:port"` to forward to, guest side.
    pub remote: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

/// Body of `POST /services/forwarder/unexpose` on the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnexposeRequest {
    /// `"ip:port"` to stop listening on, host side.
    pub local: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PortBinding, PortKey};

    #[test]
    fn test_port_mapping_wire_format() {
        let mut ports = PortMap::new();
        ports.insert(
            PortKey::tcp(80),
            vec![PortBinding::new("127.0.0.1", "80")],
        );

        let mapping = PortMapping::add(
            ports,
            vec![ConnectAddrs::new("tcp", "192.168.127.2:0")],
        );

        let json = serde_json::to_value(&mapping).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "remove": false,
                "ports": {"80/tcp": [{"HostIP": "127.0.0.1", "HostPort": "80"}]},
                "connectAddrs": [{"network": "tcp", "addr": "192.168.127.2:0"}],
            })
        );
    }

    #[test]
    fn test_connect_addrs_default_on_decode() {
        let mapping: PortMapping =
            serde_json::from_str(r#"{"remove":true,"ports":{}}"#).unwrap();
        assert!(mapping.remove);
        assert!(mapping.ports.is_empty());
        assert!(mapping.connect_addrs.is_empty());
    }

    #[test]
    fn test_expose_request_defaults_to_tcp() {
        let req: ExposeRequest =
            serde_json::from_str(r#"{"local":"127.0.0.1:80","remote":"192.168.127.2:80"}"#)
                .unwrap();
        assert_eq!(req.protocol, "tcp");
    }
}
