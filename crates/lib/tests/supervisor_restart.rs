//! Integration test: supervise a scripted fake game server and check start and
//! restart behaviour. Unix only (the fake server is a shell script).
#![cfg(unix)]

use lib::config::SupervisorConfig;
use lib::metrics::{MetricsSink, PrometheusMetrics};
use lib::supervisor::Supervisor;
use lib::Error;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

struct Fixture {
    dir: PathBuf,
    log: PathBuf,
    binary: PathBuf,
}

impl Fixture {
    /// Temp dir with a fake server that appends one line per start to `starts.log`
    /// and then runs `tail` (e.g. `exec sleep 30` or `exit 3`).
    fn new(tail: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("q3gate-supervisor-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("assets")).expect("create assets dir");
        let log = dir.join("starts.log");
        let binary = dir.join("fake-ioq3ded");
        std::fs::write(
            &binary,
            format!("#!/bin/sh\necho \"start $*\" >> '{}'\n{}\n", log.display(), tail),
        )
        .expect("write fake server");
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake server");
        Self { dir, log, binary }
    }

    fn config(&self) -> SupervisorConfig {
        let mut config = SupervisorConfig::new(format!("127.0.0.1:{}", free_udp_port()));
        config.assets_dir = self.dir.join("assets");
        config.binary = self.binary.display().to_string();
        config.watch_interval = Duration::from_millis(100);
        config
    }

    fn starts(&self) -> usize {
        std::fs::read_to_string(&self.log)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn script(&self) -> String {
        std::fs::read_to_string(self.dir.join("assets/baseq3/server.cfg")).unwrap_or_default()
    }

    fn rotation(&self) -> String {
        std::fs::read_to_string(self.dir.join("assets/baseq3/maps.cfg")).unwrap_or_default()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind free port");
    socket.local_addr().expect("local_addr").port()
}

fn touch(path: &Path, at: SystemTime) {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open for touch");
    file.set_modified(at).expect("set mtime");
}

async fn wait_for_starts(fixture: &Fixture, n: usize) -> bool {
    for _ in 0..150 {
        if fixture.starts() >= n {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn static_mode_starts_once_and_stops_on_cancel() {
    let fixture = Fixture::new("exec sleep 30");
    let supervisor = Supervisor::new(
        fixture.config(),
        Arc::new(PrometheusMetrics::new().expect("metrics")),
    )
    .expect("supervisor");
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(supervisor.run(cancel.clone()));

    assert!(wait_for_starts(&fixture, 1).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fixture.starts(), 1);
    assert!(fixture.script().contains("map q3dm7"));
    assert!(fixture.rotation().contains("map q3dm17 ; set nextmap vstr d0"));

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("supervisor stops")
        .expect("join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn rotation_file_is_rendered_before_start() {
    let fixture = Fixture::new("exit 0");
    let maps = fixture.dir.join("maps.yaml");
    std::fs::write(&maps, "- name: q3wctf1\n  type: CaptureTheFlag\n  captureLimit: 8\n")
        .expect("write maps");
    let mut config = fixture.config();
    config.maps_file = Some(maps);
    let supervisor = Supervisor::new(config, Arc::new(PrometheusMetrics::new().expect("metrics")))
        .expect("supervisor");
    let result = tokio::time::timeout(Duration::from_secs(5), supervisor.run(CancellationToken::new()))
        .await
        .expect("supervisor returns");
    assert!(result.is_ok());
    assert_eq!(fixture.starts(), 1);
    assert_eq!(
        fixture.rotation(),
        "set d0 \"seta g_gametype 4 ; capturelimit 8 ; map q3wctf1 ; set nextmap vstr d0\"\nvstr d0\n"
    );
}

#[tokio::test]
async fn static_mode_failed_exit_is_an_error() {
    let fixture = Fixture::new("exit 3");
    let supervisor = Supervisor::new(
        fixture.config(),
        Arc::new(PrometheusMetrics::new().expect("metrics")),
    )
    .expect("supervisor");
    let result = tokio::time::timeout(Duration::from_secs(5), supervisor.run(CancellationToken::new()))
        .await
        .expect("supervisor returns");
    assert!(matches!(result, Err(Error::Process { .. })));
    assert_eq!(fixture.starts(), 1);
}

#[tokio::test]
async fn watch_mode_restarts_once_per_newer_mtime() {
    let fixture = Fixture::new("exec sleep 30");
    let config_file = fixture.dir.join("config.yaml");
    std::fs::write(&config_file, "fragLimit: 10\n").expect("write config");
    let base = SystemTime::now() - Duration::from_secs(600);
    touch(&config_file, base);

    let mut config = fixture.config();
    config.config_file = Some(config_file.clone());
    let metrics = Arc::new(PrometheusMetrics::new().expect("metrics"));
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let supervisor = Supervisor::new(config, sink).expect("supervisor");
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(supervisor.run(cancel.clone()));

    assert!(wait_for_starts(&fixture, 1).await);
    assert!(fixture.script().contains("seta fraglimit \"10\""));

    // Same mtime: no restart.
    touch(&config_file, base);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fixture.starts(), 1);
    assert_eq!(metrics.config_reloads(), 0);

    std::fs::write(&config_file, "fragLimit: 40\n").expect("rewrite config");
    touch(&config_file, base + Duration::from_secs(60));
    assert!(wait_for_starts(&fixture, 2).await);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fixture.starts(), 2);
    assert_eq!(metrics.config_reloads(), 1);
    assert!(fixture.script().contains("seta fraglimit \"40\""));

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("supervisor stops")
        .expect("join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn watch_mode_invalid_reload_is_fatal() {
    let fixture = Fixture::new("exec sleep 30");
    let config_file = fixture.dir.join("config.yaml");
    std::fs::write(&config_file, "fragLimit: 10\n").expect("write config");
    let base = SystemTime::now() - Duration::from_secs(600);
    touch(&config_file, base);

    let mut config = fixture.config();
    config.config_file = Some(config_file.clone());
    let supervisor = Supervisor::new(config, Arc::new(PrometheusMetrics::new().expect("metrics")))
        .expect("supervisor");
    let handle = tokio::spawn(supervisor.run(CancellationToken::new()));
    assert!(wait_for_starts(&fixture, 1).await);

    std::fs::write(&config_file, "game:\n  type: NoSuchMode\n").expect("rewrite config");
    touch(&config_file, base + Duration::from_secs(60));
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("supervisor returns")
        .expect("join");
    assert!(matches!(result, Err(Error::Config { .. })));
    assert_eq!(fixture.starts(), 1);
}
