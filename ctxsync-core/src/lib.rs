//! ctxsync core library: domain types, configuration, errors.
//!
//! - [`types`]: component keys, source bindings, the artifact document
//! - [`config`]: `.ctxsync.yaml` loading and validation
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{RetrySettings, SyncConfig, CONFIG_FILE_NAME};
pub use error::ConfigError;
pub use types::{Artifact, ArtifactEntry, ComponentKey, SourceBinding, ARTIFACT_VERSION};
