//! The local-facing side of the tunnel: dials a `warp-server`,
//! registers a domain, and forwards each tunnelled request or
//! WebSocket to a local HTTP endpoint.

mod config;
mod connection;
mod local_request;
mod state;
mod ws_tunnel;

pub use config::ClientConfig;
pub use connection::{Connection, connect};
pub use state::{ClientState, RequestHandle};
