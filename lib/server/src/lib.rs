//! The public-facing side of the tunnel: accepts client control
//! connections, routes incoming HTTP (and upgraded WebSocket) traffic
//! to whichever connection has claimed the request's `Host`, and
//! relays request/response bodies over the duplex transport.

mod config;
mod connection;
mod ongoing_request;
mod routing;
mod state;
mod ws_tunnel;

pub use config::ServerConfig;
pub use connection::ClientConnectionState;
pub use ongoing_request::{OngoingRequest, TunnelResponse};
pub use routing::{serve, serve_handler};
pub use state::{HostRegistry, ServerState};
