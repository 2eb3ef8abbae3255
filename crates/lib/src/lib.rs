//! q3gate core library: the realtime transport gateway that lets browser
//! clients reach a UDP-only game server, the out-of-band query client, and the
//! supervisor that keeps the game server process running.

pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod net;
pub mod quake;
pub mod supervisor;

pub use error::{Error, Result};
