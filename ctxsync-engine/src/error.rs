use std::path::PathBuf;

use thiserror::Error;

use ctxsync_core::{ComponentKey, ConfigError};
use ctxsync_store::StoreError;

/// Error surface for the synchronization engine and its watcher.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("no source file is bound to component '{0}'")]
    UnknownKey(ComponentKey),

    #[error("watch failure: {reason}")]
    WatchFailure { reason: String },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{task} task join failure: {reason}")]
    Join { task: &'static str, reason: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn watch_failure(reason: impl Into<String>) -> EngineError {
    EngineError::WatchFailure {
        reason: reason.into(),
    }
}
