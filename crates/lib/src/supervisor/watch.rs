//! Configuration file watcher: polls the modification time on an interval and
//! emits a reload event when it moves strictly forward.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Last observed modification time of the watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchState {
    last: SystemTime,
}

impl WatchState {
    pub fn new(initial: SystemTime) -> Self {
        Self { last: initial }
    }

    pub fn last(&self) -> SystemTime {
        self.last
    }

    /// Record one poll. Returns true when `observed` is strictly newer than the
    /// previously recorded time. A successful observation is always recorded;
    /// a failed stat (`None`) leaves the recorded time as it was.
    pub fn observe(&mut self, observed: Option<SystemTime>) -> bool {
        let Some(observed) = observed else {
            return false;
        };
        let changed = observed > self.last;
        self.last = observed;
        changed
    }
}

async fn modified(path: &Path) -> std::io::Result<SystemTime> {
    tokio::fs::metadata(path).await?.modified()
}

/// Stat `path` once (failure is fatal to the caller) and start polling it.
/// Reload events are delivered on a channel of capacity one: while a reload is
/// pending, further changes coalesce into it.
pub async fn watch(
    path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<()>> {
    let initial = modified(&path)
        .await
        .map_err(|e| Error::io(format!("stat {}", path.display()), e))?;
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut state = WatchState::new(initial);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let observed = match modified(&path).await {
                Ok(t) => Some(t),
                Err(e) => {
                    log::warn!("watch: stat {} failed: {}", path.display(), e);
                    None
                }
            };
            if !state.observe(observed) {
                continue;
            }
            log::info!("{} changed, scheduling reload", path.display());
            match tx.try_send(()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(())) => {
                    log::debug!("reload already pending for {}", path.display());
                }
                Err(mpsc::error::TrySendError::Closed(())) => return,
            }
        }
    });
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn fires_only_on_strictly_newer() {
        let mut s = WatchState::new(at(100));
        assert!(!s.observe(Some(at(100))));
        assert!(!s.observe(Some(at(100))));
        assert!(s.observe(Some(at(101))));
        assert!(!s.observe(Some(at(101))));
    }

    #[test]
    fn failed_stat_keeps_recorded_time() {
        let mut s = WatchState::new(at(100));
        assert!(!s.observe(None));
        assert_eq!(s.last(), at(100));
        assert!(!s.observe(Some(at(100))));
    }

    #[test]
    fn older_observation_is_recorded_without_firing() {
        let mut s = WatchState::new(at(100));
        assert!(!s.observe(Some(at(50))));
        assert_eq!(s.last(), at(50));
        assert!(s.observe(Some(at(100))));
    }

    #[tokio::test]
    async fn missing_file_is_fatal() {
        let path = std::env::temp_dir().join(format!("q3gate-missing-{}", uuid::Uuid::new_v4()));
        let err = watch(path, Duration::from_millis(10), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[tokio::test]
    async fn emits_event_after_touch() {
        let path = std::env::temp_dir().join(format!("q3gate-watch-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "fragLimit: 10\n").unwrap();
        let cancel = CancellationToken::new();
        let mut rx = watch(path.clone(), Duration::from_millis(20), cancel.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());

        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_modified(SystemTime::now() + Duration::from_secs(60)).unwrap();
        drop(f);
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        cancel.cancel();
        let _ = std::fs::remove_file(&path);
    }
}
