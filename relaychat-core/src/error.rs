use std::path::PathBuf;

use thiserror::Error;

/// Relay error taxonomy.
///
/// `Transport`, `Protocol` and `Startup` are recovered where they occur and
/// only ever reach the logs. `Persistence` is returned from the Log Store so
/// the engine can apply its persist-failure policy.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Persistence error writing {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Startup error loading {}: {reason}", .path.display())]
    Startup { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    pub fn startup(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Startup {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Short category name used as a structured log field
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Persistence { .. } => "persistence",
            Self::Startup { .. } => "startup",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
