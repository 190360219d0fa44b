//! portbridge port proxy
//!
//! Runs on the host side of the guest/host boundary. Accepts port change
//! notifications from the guest agent (one JSON document per connection)
//! and maintains the matching set of local TCP listeners and UDP sockets,
//! relaying accepted traffic to the same port on the upstream guest
//! address.

pub mod config;
pub mod proxy;
