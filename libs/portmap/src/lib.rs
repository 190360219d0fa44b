//! Port mapping data model.
//!
//! These types describe where container ports surface on the host and form
//! the wire contract between the guest agent and the host-side port proxy:
//! a [`PortMap`] collects host bindings per `port/protocol` key, and a
//! [`PortMapping`] is a single add/remove notification shipped across the
//! guest/host boundary as one JSON document.

mod error;
mod message;
mod types;

pub use error::PortKeyError;
pub use message::{ConnectAddrs, ExposeRequest, PortMapping, UnexposeRequest};
pub use types::{PortBinding, PortKey, PortMap, Protocol};
