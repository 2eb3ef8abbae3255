//! Game-specific pieces: the out-of-band query protocol, server configuration
//! and the demo license gate.

pub mod eula;
pub mod oob;
pub mod server_config;

pub use oob::{InfoResponse, OobClient, Player, StatusResponse};
pub use server_config::{GameType, Map, ServerConfig};
