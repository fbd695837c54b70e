//! Error types for changewatch.
//!
//! Library crates use [`ChangeWatchError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all changewatch operations.
#[derive(Debug, thiserror::Error)]
pub enum ChangeWatchError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The listing fetch was refused or rate-limited (matched a block signature).
    #[error("fetch blocked: {0}")]
    FetchBlocked(String),

    /// Network/HTTP failure or timeout while fetching a listing.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Listing parsing or selector compilation error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Datastore read or write failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The extraction worker could not be started.
    #[error("trigger launch error: {0}")]
    TriggerLaunch(String),

    /// The extraction worker (or processing trigger) ran but failed or timed out.
    #[error("worker runtime error: {0}")]
    WorkerRuntime(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ChangeWatchError>;

impl ChangeWatchError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable taxonomy code used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "CONFIG_ERROR",
            Self::FetchBlocked(_) => "FETCH_BLOCKED",
            Self::Fetch(_) => "FETCH_ERROR",
            Self::Parse { .. } => "PARSE_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::TriggerLaunch(_) => "TRIGGER_LAUNCH_ERROR",
            Self::WorkerRuntime(_) => "WORKER_RUNTIME_ERROR",
            Self::Io { .. } => "IO_ERROR",
        }
    }
}
