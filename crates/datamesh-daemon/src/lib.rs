//! Datamesh Daemon - network side of a mesh node
//!
//! Features:
//! - TCP server: one JSON request per connection, served on its own task
//! - Controller: well-known port, starts sibling servers on `add`
//! - UDP presence: periodic host descriptor broadcast, stateless listener
//! - Interface discovery for addresses and the broadcast target
//! - Client helpers for one-shot requests

pub mod client;
pub mod controller;
pub mod dispatch;
pub mod netif;
pub mod presence;
pub mod server;

pub use client::{request_json, send_raw, send_request};
pub use controller::{launch, Controller, PortState};
pub use dispatch::Handler;
pub use netif::Interface;
pub use presence::{
    Broadcaster, HostDescriptor, PortEntry, PresenceEvent, PresenceListener, ServerHosts,
};
pub use server::MeshServer;
