//! Error types for ctxsync-store.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use ctxsync_core::ComponentKey;

/// Failures of a single write-and-verify attempt. Every variant is eligible
/// for retry.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Temp-file write, flush or rename failed (disk full, permissions, ...).
    #[error("write failed at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The post-write read returned a different value than requested.
    #[error("verification mismatch for '{key}': expected {expected}, found {found}")]
    VerificationMismatch {
        key: ComponentKey,
        expected: String,
        found: String,
    },

    /// The post-write read found no section for the key.
    #[error("artifact has no section '{key}' after write")]
    MissingSection { key: ComponentKey },

    /// The artifact on disk is not a valid document.
    #[error("artifact at {path} is malformed: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// An I/O error outside the write path, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error.
    #[error("artifact JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Terminal outcome of a retry sequence that never succeeded.
#[derive(Debug, Error)]
pub enum RetryError {
    /// Every attempt failed.
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        delays: Vec<Duration>,
        #[source]
        last: StoreError,
    },

    /// A stop was requested at a retry boundary.
    #[error("stopped after {attempts} attempt(s): {last}")]
    Cancelled {
        attempts: u32,
        delays: Vec<Duration>,
        #[source]
        last: StoreError,
    },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn delays(&self) -> &[Duration] {
        match self {
            RetryError::Exhausted { delays, .. } | RetryError::Cancelled { delays, .. } => delays,
        }
    }

    pub fn last_error(&self) -> &StoreError {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Cancelled { last, .. } => last,
        }
    }
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`StoreError::Write`].
pub(crate) fn write_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Write {
        path: path.into(),
        source,
    }
}
