//! wsmesh-server: the clustered WebSocket message server.
//!
//! Accepts long-lived encrypted WebSocket connections, routes packets
//! through dynamic user/remote route tables, tracks sessions with UID
//! binding and pub/sub channels, supervises heartbeat liveness, and
//! federates across peer nodes through signed inner envelopes.

pub mod cluster;
pub mod server;
pub mod session;
pub mod tls;

pub use cluster::{DispatchHint, Peer};
pub use server::{MessageServer, ServerConfig};
pub use session::Session;
