//! Metrics sink injected into the supervisor and the tunnel proxy.
//!
//! Each [`PrometheusMetrics`] owns its own registry, so several instances
//! (e.g. one per test) never collide.

use crate::error::Result;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// Capability for publishing server and gateway measurements.
pub trait MetricsSink: Send + Sync {
    fn set_active_players(&self, count: usize);
    fn set_player_score(&self, player: &str, map: &str, score: i64);
    fn set_player_ping(&self, player: &str, ping: i64);
    fn inc_config_reloads(&self);
    fn tunnel_opened(&self);
    fn tunnel_closed(&self);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn set_active_players(&self, _count: usize) {}
    fn set_player_score(&self, _player: &str, _map: &str, _score: i64) {}
    fn set_player_ping(&self, _player: &str, _ping: i64) {}
    fn inc_config_reloads(&self) {}
    fn tunnel_opened(&self) {}
    fn tunnel_closed(&self) {}
}

pub struct PrometheusMetrics {
    registry: Registry,
    active_players: IntGauge,
    player_scores: IntGaugeVec,
    player_pings: IntGaugeVec,
    config_reloads: IntCounter,
    active_connections: IntGauge,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let active_players =
            IntGauge::new("quake_active_players", "The current number of active players")?;
        let player_scores = IntGaugeVec::new(
            Opts::new("quake_player_scores", "Current scores by player, by map"),
            &["player", "map"],
        )?;
        let player_pings = IntGaugeVec::new(
            Opts::new("quake_player_pings", "Current ping by player"),
            &["player"],
        )?;
        let config_reloads = IntCounter::new("quake_config_reloads", "Config file reload count")?;
        let active_connections = IntGauge::new(
            "quake_active_connections",
            "The current number of active websocket proxy connections",
        )?;
        registry.register(Box::new(active_players.clone()))?;
        registry.register(Box::new(player_scores.clone()))?;
        registry.register(Box::new(player_pings.clone()))?;
        registry.register(Box::new(config_reloads.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        Ok(Self {
            registry,
            active_players,
            player_scores,
            player_pings,
            config_reloads,
            active_connections,
        })
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn config_reloads(&self) -> u64 {
        self.config_reloads.get()
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.get()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn set_active_players(&self, count: usize) {
        self.active_players.set(count as i64);
    }

    fn set_player_score(&self, player: &str, map: &str, score: i64) {
        self.player_scores.with_label_values(&[player, map]).set(score);
    }

    fn set_player_ping(&self, player: &str, ping: i64) {
        self.player_pings.with_label_values(&[player]).set(ping);
    }

    fn inc_config_reloads(&self) {
        self.config_reloads.inc();
    }

    fn tunnel_opened(&self) {
        self.active_connections.inc();
    }

    fn tunnel_closed(&self) {
        self.active_connections.dec();
    }
}
