//! ctxsync engine: update queue, source watcher and the synchronization
//! engine that drives the artifact store.
//!
//! Data flow: file event → [`WatchSession`] → [`UpdateQueue`] → processing
//! loop → retry controller → atomic writer → verifier → [`EngineStatus`].

mod engine;
mod error;
pub mod queue;
mod runtime;
pub mod status;
pub mod watcher;

pub use engine::SyncEngine;
pub use error::EngineError;
pub use queue::{Enqueued, PendingUpdate, QueueClosed, UpdateQueue};
pub use runtime::{init_tracing, push_once, run, run_blocking, sync_once};
pub use status::{
    AppliedRecord, ComponentStatus, EngineState, EngineStatus, Health, WatchStatus,
};
pub use watcher::{SourceChange, WatchMode, WatchOptions, WatchSession};
