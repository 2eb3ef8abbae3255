//! Error taxonomy shared by the gateway, the out-of-band client and the supervisor.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Address could not be parsed or resolved.
    #[error("cannot resolve address {addr}: {reason}")]
    Resolution { addr: String, reason: String },

    /// No UDP reply arrived before the round-trip deadline.
    #[error("no reply from {addr} within {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    /// Malformed out-of-band response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// WebSocket handshake failed.
    #[error("websocket upgrade failed: {0}")]
    Upgrade(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be read, parsed or serialized.
    #[error("configuration {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    /// Game server process could not be spawned or waited on.
    #[error("process {program}: {reason}")]
    Process { program: String, reason: String },

    /// The demo license was not accepted.
    #[error("you must agree to the EULA to continue")]
    EulaNotAccepted,

    #[error("metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn config(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Config {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn process(program: impl Into<String>, reason: impl ToString) -> Self {
        Self::Process {
            program: program.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
