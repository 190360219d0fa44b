//! portbridge guest agent
//!
//! Runs inside the VM and synchronizes container and Kubernetes port
//! bindings to the host. Event monitors watch Docker or containerd, the
//! Kubernetes Service API, iptables DNAT rules and /proc/net; a tracker
//! keeps the authoritative per-container state and ships change
//! notifications across the guest/host boundary through a pluggable
//! forwarder transport.

pub mod config;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod monitors;
pub mod nat;
pub mod tracker;
