//! Core port mapping types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::PortKeyError;

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Lowercase protocol name as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = PortKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(PortKeyError::Protocol(other.to_string())),
        }
    }
}

/// Identifies a published container port, canonically `"<port>/<protocol>"`.
///
/// Serializes as its canonical string so it can be used directly as a JSON
/// map key (`"80/tcp"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortKey {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortKey {
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, protocol }
    }

    pub fn tcp(port: u16) -> Self {
        Self::new(port, Protocol::Tcp)
    }

    pub fn udp(port: u16) -> Self {
        Self::new(port, Protocol::Udp)
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl FromStr for PortKey {
    type Err = PortKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, protocol) = s
            .split_once('/')
            .ok_or_else(|| PortKeyError::Format(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| PortKeyError::Port(port.to_string()))?;

        Ok(Self {
            port,
            protocol: protocol.parse()?,
        })
    }
}

impl Serialize for PortKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Where a container port surfaces on the host.
///
/// Both fields are strings to match the engine APIs that produce them; an
/// empty host IP means the binding is unusable and is stripped by monitors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostIP")]
    pub host_ip: String,
    #[serde(rename = "HostPort")]
    pub host_port: String,
}

impl PortBinding {
    pub fn new(host_ip: impl Into<String>, host_port: impl Into<String>) -> Self {
        Self {
            host_ip: host_ip.into(),
            host_port: host_port.into(),
        }
    }

    /// `"ip:port"` form used by the gateway expose API and listener keys.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host_ip, self.host_port)
    }
}

/// Mapping from a published port to its host bindings.
///
/// One container port may bind multiple host addresses, hence the list per
/// key. A BTreeMap keeps wire output deterministic.
pub type PortMap = BTreeMap<PortKey, Vec<PortBinding>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_key_roundtrip() {
        let key: PortKey = "80/tcp".parse().unwrap();
        assert_eq!(key, PortKey::tcp(80));
        assert_eq!(key.to_string(), "80/tcp");

        let key: PortKey = "53/UDP".parse().unwrap();
        assert_eq!(key, PortKey::udp(53));
        assert_eq!(key.to_string(), "53/udp");
    }

    #[test]
    fn test_port_key_rejects_garbage() {
        assert_eq!(
            "80".parse::<PortKey>(),
            Err(PortKeyError::Format("80".to_string()))
        );
        assert_eq!(
            "99999/tcp".parse::<PortKey>(),
            Err(PortKeyError::Port("99999".to_string()))
        );
        assert_eq!(
            "80/sctp".parse::<PortKey>(),
            Err(PortKeyError::Protocol("sctp".to_string()))
        );
    }

    #[test]
    fn test_port_map_serializes_keys_as_strings() {
        let mut map = PortMap::new();
        map.insert(
            PortKey::tcp(80),
            vec![PortBinding::new("127.0.0.1", "8080")],
        );

        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(
            json,
            r#"{"80/tcp":[{"HostIP":"127.0.0.1","HostPort":"8080"}]}"#
        );

        let back: PortMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_binding_addr() {
        let binding = PortBinding::new("0.0.0.0", "9119");
        assert_eq!(binding.addr(), "0.0.0.0:9119");
    }
}
