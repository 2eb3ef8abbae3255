//! Gateway: HTTP + WebSocket on a single port, bridged to the game server's UDP socket.
//!
//! The multiplexer splits accepted connections between the HTTP router and the
//! tunnel proxy; each branch runs its own `axum::serve` loop.

pub mod mux;
pub mod proxy;
mod router;
mod server;

pub use mux::{is_websocket_upgrade, Multiplexer};
pub use proxy::TunnelProxy;
pub use router::{http_router, HttpState};
pub use server::{run_gateway, serve_gateway};
