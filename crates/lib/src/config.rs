//! Runtime settings for the gateway and the supervisor.
//!
//! Values come from command-line flags, then environment variables, then
//! defaults. Addresses without an explicit value default to the host's
//! primary IPv4 address on the well-known ports.

use crate::error::Result;
use crate::net;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CLIENT_PORT: u16 = 8080;
pub const DEFAULT_SERVER_PORT: u16 = 27960;
pub const DEFAULT_BINARY: &str = "ioq3ded";

/// Gateway listen address and the game server it fronts.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address browsers connect to (HTTP and WebSocket on one port).
    pub client_addr: String,
    /// Game server UDP address (`host:port`).
    pub server_addr: String,
}

/// Game server process settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Working directory of the game server; `baseq3/server.cfg` is written under it.
    pub assets_dir: PathBuf,

    /// YAML game configuration. When absent the server runs with the built-in defaults and is never reloaded.
    pub config_file: Option<PathBuf>,

    /// YAML map rotation rendered to `baseq3/maps.cfg` on startup. Defaults to the built-in rotation.
    pub maps_file: Option<PathBuf>,

    /// How often the configuration file's modification time is polled.
    pub watch_interval: Duration,

    /// How often player metrics are polled with `getstatus`.
    pub metrics_interval: Duration,

    /// Dedicated server executable.
    pub binary: String,

    /// Address the game server binds (`net_ip`/`net_port`).
    pub server_addr: String,
}

fn default_assets_dir() -> PathBuf {
    PathBuf::from("assets")
}

fn default_watch_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_binary() -> String {
    DEFAULT_BINARY.to_string()
}

impl SupervisorConfig {
    /// Settings with defaults for everything but the bind address.
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            assets_dir: default_assets_dir(),
            config_file: None,
            maps_file: None,
            watch_interval: default_watch_interval(),
            metrics_interval: default_metrics_interval(),
            binary: default_binary(),
            server_addr: server_addr.into(),
        }
    }
}

/// Non-empty, trimmed value of an environment variable.
fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn resolve_addr(flag: Option<String>, env_key: &str, default_port: u16) -> Result<String> {
    if let Some(addr) = flag.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        return Ok(addr);
    }
    if let Some(addr) = env_value(env_key) {
        return Ok(addr);
    }
    let host = net::detect_host_ipv4()?;
    Ok(format!("{}:{}", host, default_port))
}

/// Resolve the gateway listen address: flag, then Q3GATE_CLIENT_ADDR, then `<host-ipv4>:8080`.
pub fn resolve_client_addr(flag: Option<String>) -> Result<String> {
    resolve_addr(flag, "Q3GATE_CLIENT_ADDR", DEFAULT_CLIENT_PORT)
}

/// Resolve the game server address: flag, then Q3GATE_SERVER_ADDR, then `<host-ipv4>:27960`.
pub fn resolve_server_addr(flag: Option<String>) -> Result<String> {
    resolve_addr(flag, "Q3GATE_SERVER_ADDR", DEFAULT_SERVER_PORT)
}

/// Assets root: flag, then Q3GATE_ASSETS_DIR, then `assets`.
pub fn resolve_assets_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| env_value("Q3GATE_ASSETS_DIR").map(PathBuf::from))
        .unwrap_or_else(default_assets_dir)
}

/// Game configuration file: flag, then Q3GATE_CONFIG.
pub fn resolve_config_file(flag: Option<PathBuf>) -> Option<PathBuf> {
    flag.or_else(|| env_value("Q3GATE_CONFIG").map(PathBuf::from))
}

/// Map rotation file: flag, then Q3GATE_MAPS.
pub fn resolve_maps_file(flag: Option<PathBuf>) -> Option<PathBuf> {
    flag.or_else(|| env_value("Q3GATE_MAPS").map(PathBuf::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_defaults() {
        let s = SupervisorConfig::new("0.0.0.0:27960");
        assert_eq!(s.assets_dir, PathBuf::from("assets"));
        assert_eq!(s.watch_interval, Duration::from_secs(15));
        assert_eq!(s.metrics_interval, Duration::from_secs(5));
        assert_eq!(s.binary, "ioq3ded");
        assert!(s.config_file.is_none());
        assert!(s.maps_file.is_none());
    }

    #[test]
    fn explicit_flag_wins() {
        assert_eq!(
            resolve_client_addr(Some(" 127.0.0.1:9000 ".to_string())).unwrap(),
            "127.0.0.1:9000"
        );
        assert_eq!(
            resolve_assets_dir(Some(PathBuf::from("/srv/q3"))),
            PathBuf::from("/srv/q3")
        );
    }
}
