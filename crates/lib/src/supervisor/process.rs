//! Game server process: fixed launch template and per-generation handles.
//!
//! Each spawn produces a fresh [`SupervisedProcess`] whose child is owned by a
//! dedicated waiter task. The supervisor never touches a child directly; it
//! asks the waiter to kill it, so an old generation's waiter can finish
//! independently of the next generation.

use crate::error::{Error, Result};
use crate::net;
use crate::quake::server_config::{BASE_GAME, SERVER_SCRIPT};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::sync::oneshot;

/// Program, arguments and working directory shared by every generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTemplate {
    pub program: String,
    pub args: Vec<String>,
    pub dir: PathBuf,
}

impl LaunchTemplate {
    /// Dedicated-server invocation bound to `bind_addr`, run from `assets_dir`.
    pub fn dedicated(program: &str, bind_addr: &str, assets_dir: &Path) -> Result<Self> {
        let (host, port) = net::split_host_port(bind_addr)?;
        let home = assets_dir.display().to_string();
        let args: Vec<String> = [
            "+set", "dedicated", "1",
            "+set", "net_ip", host.as_str(),
            "+set", "net_port", port.as_str(),
            "+set", "com_homepath", home.as_str(),
            "+set", "com_basegame", BASE_GAME,
            "+set", "com_gamename", "Quake3Arena",
            "+exec", SERVER_SCRIPT,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        Ok(Self {
            program: program.to_string(),
            args,
            dir: assets_dir.to_path_buf(),
        })
    }

    /// Start generation `generation`; stdout/stderr are inherited.
    pub fn spawn(&self, generation: u64) -> Result<SupervisedProcess> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::process(&self.program, format!("spawn failed: {}", e)))?;
        let pid = child.id();
        log::info!(
            "started {} (generation {}, pid {})",
            self.program,
            generation,
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
        );

        let (kill_tx, kill_rx) = oneshot::channel::<oneshot::Sender<()>>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let program = self.program.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(ack) = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        log::debug!("kill generation {}: {}", generation, e);
                    }
                    let _ = ack.send(());
                    child.wait().await
                }
            };
            match &status {
                Ok(s) => log::info!("{} (generation {}) exited: {}", program, generation, s),
                Err(e) => log::warn!("{} (generation {}) wait failed: {}", program, generation, e),
            }
            let _ = exit_tx.send(status);
        });

        Ok(SupervisedProcess {
            generation,
            pid,
            program: self.program.clone(),
            kill_tx: Some(kill_tx),
            exit_rx: Some(exit_rx),
        })
    }
}

/// Handle to one generation of the game server.
#[derive(Debug)]
pub struct SupervisedProcess {
    generation: u64,
    pid: Option<u32>,
    program: String,
    kill_tx: Option<oneshot::Sender<oneshot::Sender<()>>>,
    exit_rx: Option<oneshot::Receiver<std::io::Result<ExitStatus>>>,
}

impl SupervisedProcess {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Issue a kill and return once the signal has been sent or the process is
    /// known to have exited already. Does not wait for the exit itself.
    pub async fn terminate(&mut self) {
        let Some(kill_tx) = self.kill_tx.take() else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if kill_tx.send(ack_tx).is_err() {
            log::debug!("generation {} already exited", self.generation);
            return;
        }
        if ack_rx.await.is_err() {
            log::debug!("generation {} exited before kill", self.generation);
        }
    }

    /// Wait for the process to exit on its own (or after [`terminate`](Self::terminate)).
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let exit_rx = self
            .exit_rx
            .take()
            .ok_or_else(|| Error::process(&self.program, "exit status already taken"))?;
        match exit_rx.await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(Error::process(&self.program, format!("wait failed: {}", e))),
            Err(_) => Err(Error::process(&self.program, "waiter task ended unexpectedly")),
        }
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        // Never leave a generation running without a handle.
        if let Some(kill_tx) = self.kill_tx.take() {
            let (ack_tx, _) = oneshot::channel();
            let _ = kill_tx.send(ack_tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedicated_template() {
        let t = LaunchTemplate::dedicated("ioq3ded", "0.0.0.0:27960", Path::new("assets")).unwrap();
        assert_eq!(t.program, "ioq3ded");
        assert_eq!(t.dir, PathBuf::from("assets"));
        assert_eq!(
            t.args.join(" "),
            "+set dedicated 1 +set net_ip 0.0.0.0 +set net_port 27960 +set com_homepath assets \
             +set com_basegame baseq3 +set com_gamename Quake3Arena +exec server.cfg"
        );
    }

    #[test]
    fn dedicated_template_rejects_bad_address() {
        assert!(matches!(
            LaunchTemplate::dedicated("ioq3ded", "27960", Path::new("assets")),
            Err(Error::Resolution { .. })
        ));
    }

    #[tokio::test]
    async fn spawn_failure_is_process_error() {
        let t = LaunchTemplate {
            program: "/nonexistent/q3gate-test-binary".to_string(),
            args: Vec::new(),
            dir: std::env::temp_dir(),
        };
        assert!(matches!(t.spawn(1), Err(Error::Process { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_kills_and_wait_reports_exit() {
        let t = LaunchTemplate {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
            dir: std::env::temp_dir(),
        };
        let mut p = t.spawn(1).unwrap();
        p.terminate().await;
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), p.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        // Terminating again is a no-op.
        p.terminate().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_after_exit_returns() {
        let t = LaunchTemplate {
            program: "true".to_string(),
            args: Vec::new(),
            dir: std::env::temp_dir(),
        };
        let mut p = t.spawn(7).unwrap();
        assert!(p.wait().await.unwrap().success());
        p.terminate().await;
        assert_eq!(p.generation(), 7);
    }
}
