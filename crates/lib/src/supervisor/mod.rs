//! Game server supervisor.
//!
//! Two modes:
//! - static: no configuration file. The default configuration is written once,
//!   the server is started and the supervisor waits for it to exit.
//! - watch: the configuration file is regenerated into the console script on
//!   startup and before every restart; a poller restarts the server whenever
//!   the file's modification time moves forward.
//!
//! In both modes the map rotation is written to `baseq3/maps.cfg` once on
//! startup, and player metrics are polled with `getstatus`.

pub mod process;
pub mod watch;

pub use process::{LaunchTemplate, SupervisedProcess};
pub use watch::WatchState;

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;
use crate::net;
use crate::quake::server_config::{self, ServerConfig};
use crate::quake::OobClient;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle state, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Running,
    ReloadPending,
    Restarting,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Stopped => "stopped",
            State::Starting => "starting",
            State::Running => "running",
            State::ReloadPending => "reload pending",
            State::Restarting => "restarting",
            State::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    template: LaunchTemplate,
    query_addr: String,
    metrics: Arc<dyn MetricsSink>,
    generation: u64,
    state: State,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let template =
            LaunchTemplate::dedicated(&config.binary, &config.server_addr, &config.assets_dir)?;
        let query_addr = net::local_query_addr(&config.server_addr)?;
        Ok(Self {
            config,
            template,
            query_addr,
            metrics,
            generation: 0,
            state: State::Stopped,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Run until `cancel` fires (watch mode) or the server exits (static mode).
    /// Configuration and spawn failures end the loop with an error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let scope = cancel.child_token();
        let poller = spawn_metrics_poller(
            self.query_addr.clone(),
            self.config.metrics_interval,
            Arc::clone(&self.metrics),
            scope.clone(),
        );
        let result = self.run_mode(&scope).await;
        scope.cancel();
        let _ = poller.await;
        if result.is_err() {
            self.transition(State::Failed);
        }
        result
    }

    async fn run_mode(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.write_rotation().await?;
        match self.config.config_file.clone() {
            Some(path) => self.run_watching(path, cancel).await,
            None => self.run_static(cancel).await,
        }
    }

    /// Render the rotation file, or the built-in rotation when none is configured.
    async fn write_rotation(&self) -> Result<()> {
        let maps = match &self.config.maps_file {
            Some(path) => server_config::load_rotation(path).await?,
            None => ServerConfig::default().maps,
        };
        let written = server_config::write_rotation(&self.config.assets_dir, &maps).await?;
        log::info!("wrote {} map rotation entries to {}", maps.len(), written.display());
        Ok(())
    }

    async fn run_static(&mut self, cancel: &CancellationToken) -> Result<()> {
        let script = ServerConfig::default().to_console_script();
        let path = server_config::write_script(&self.config.assets_dir, &script).await?;
        log::info!("wrote default configuration to {}", path.display());

        let mut current = self.start()?;
        tokio::select! {
            _ = cancel.cancelled() => {
                current.terminate().await;
                self.transition(State::Stopped);
                Ok(())
            }
            status = current.wait() => {
                let status = status?;
                self.transition(State::Stopped);
                if status.success() {
                    Ok(())
                } else {
                    Err(Error::process(&self.template.program, format!("exited with {}", status)))
                }
            }
        }
    }

    async fn run_watching(&mut self, path: PathBuf, cancel: &CancellationToken) -> Result<()> {
        self.regenerate(&path).await?;
        let mut reloads = watch::watch(path.clone(), self.config.watch_interval, cancel.clone())
            .await
            .map_err(|e| Error::config(&path, e))?;
        let mut current = self.start()?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = reloads.recv() => {
                    if event.is_none() {
                        break;
                    }
                }
            }
            self.transition(State::ReloadPending);
            self.regenerate(&path).await?;

            self.transition(State::Restarting);
            current.terminate().await;
            current = self.start()?;
            self.metrics.inc_config_reloads();
            log::info!("configuration reloaded (generation {})", self.generation);
        }

        current.terminate().await;
        self.transition(State::Stopped);
        Ok(())
    }

    /// Re-read the configuration file and rewrite the console script.
    async fn regenerate(&self, path: &std::path::Path) -> Result<()> {
        let config = ServerConfig::load(path).await?;
        let script = config.to_console_script();
        let written = server_config::write_script(&self.config.assets_dir, &script).await?;
        log::info!("generated {} from {}", written.display(), path.display());
        Ok(())
    }

    /// Spawn the next generation.
    fn start(&mut self) -> Result<SupervisedProcess> {
        self.transition(State::Starting);
        self.generation += 1;
        let process = self.template.spawn(self.generation)?;
        self.transition(State::Running);
        Ok(process)
    }

    fn transition(&mut self, next: State) {
        if self.state != next {
            log::debug!("supervisor: {} -> {}", self.state, next);
            self.state = next;
        }
    }
}

/// Poll `getstatus` on an interval and publish player metrics. Failures are
/// logged and the next tick tries again.
fn spawn_metrics_poller(
    addr: String,
    interval: Duration,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let client = OobClient::new();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            let status = tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => tokio::select! {
                    _ = cancel.cancelled() => return,
                    status = client.get_status(&addr) => status,
                },
            };
            let status = match status {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("metrics poll of {} failed: {}", addr, e);
                    continue;
                }
            };
            metrics.set_active_players(status.players.len());
            let map = status.configuration.get("mapname");
            for player in &status.players {
                if let Some(map) = map {
                    metrics.set_player_score(&player.name, map, player.score);
                }
                metrics.set_player_ping(&player.name, player.ping);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;

    #[test]
    fn new_rejects_unsplittable_address() {
        let config = SupervisorConfig::new("no-port-here");
        assert!(Supervisor::new(config, Arc::new(NoopMetrics)).is_err());
    }

    #[test]
    fn starts_stopped() {
        let s = Supervisor::new(SupervisorConfig::new("0.0.0.0:27960"), Arc::new(NoopMetrics))
            .unwrap();
        assert_eq!(s.state(), State::Stopped);
        assert_eq!(s.generation(), 0);
        assert_eq!(s.query_addr, "127.0.0.1:27960");
    }

    #[tokio::test]
    async fn missing_config_file_is_fatal() {
        let dir = std::env::temp_dir().join(format!("q3gate-sup-{}", uuid::Uuid::new_v4()));
        let mut config = SupervisorConfig::new("127.0.0.1:27960");
        config.assets_dir = dir.clone();
        config.config_file = Some(dir.join("missing.yaml"));
        config.binary = "/nonexistent/q3gate-test-binary".to_string();
        let s = Supervisor::new(config, Arc::new(NoopMetrics)).unwrap();
        let err = s.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn invalid_rotation_file_is_fatal() {
        let dir = std::env::temp_dir().join(format!("q3gate-sup-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let maps = dir.join("maps.yaml");
        std::fs::write(&maps, "- name: q3dm1\n  type: Golf\n").unwrap();
        let mut config = SupervisorConfig::new("127.0.0.1:27960");
        config.assets_dir = dir.join("assets");
        config.maps_file = Some(maps);
        config.binary = "/nonexistent/q3gate-test-binary".to_string();
        let s = Supervisor::new(config, Arc::new(NoopMetrics)).unwrap();
        let err = s.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn static_mode_spawn_failure_is_process_error() {
        let dir = std::env::temp_dir().join(format!("q3gate-sup-{}", uuid::Uuid::new_v4()));
        let mut config = SupervisorConfig::new("127.0.0.1:27960");
        config.assets_dir = dir.clone();
        config.binary = "/nonexistent/q3gate-test-binary".to_string();
        let s = Supervisor::new(config, Arc::new(NoopMetrics)).unwrap();
        let err = s.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Process { .. }));
        assert!(server_config::script_path(&dir).exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
