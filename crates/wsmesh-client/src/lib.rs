//! wsmesh-client: the bridge client.
//!
//! A long-lived client to a single WebSocket endpoint, resilient to
//! disconnection, exposing request/response and publish/subscribe
//! semantics. Used both by end-user clients and by a server node to reach
//! its peer nodes.

mod client;
mod tls;

pub use client::{BridgeClient, ClientConfig, ClientEvent};
