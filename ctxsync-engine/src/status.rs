//! Engine status surface.
//!
//! Per-key results are recorded into a [`StatusBoard`] by the processing
//! loop and the watch supervisor. [`StatusBoard::snapshot`] merges them with
//! the queue's pending/in-flight view into a serializable [`EngineStatus`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use ctxsync_core::{Artifact, ComponentKey, SourceBinding};
use ctxsync_store::{Retried, RetryError, Verified, WriteResult};

use crate::queue::QueueSnapshot;
use crate::watcher::WatchMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Outcome of the most recent write sequence for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Nothing processed for this key since start.
    Idle,
    Synced,
    /// Retries exhausted or cancelled; the artifact keeps its last verified value.
    Failed,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Health::Idle => "idle",
            Health::Synced => "synced",
            Health::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Last verified section value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedRecord {
    pub hash: String,
    pub updated_at: DateTime<Utc>,
    /// `false` when the last write was skipped because the hash matched.
    pub written: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchStatus {
    pub mode: Option<WatchMode>,
    pub restarts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentStatus {
    pub key: ComponentKey,
    pub source: PathBuf,
    pub source_present: bool,
    pub pending: bool,
    pub in_flight: bool,
    pub health: Health,
    pub last_applied: Option<AppliedRecord>,
    pub last_attempts: u32,
    pub last_retry_delays_ms: Vec<u64>,
    pub last_error: Option<String>,
    /// Verified write sequences completed since start.
    pub writes: u64,
}

impl ComponentStatus {
    pub fn retries(&self) -> u32 {
        self.last_attempts.saturating_sub(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub watch: WatchStatus,
    pub components: Vec<ComponentStatus>,
}

impl EngineStatus {
    pub fn component(&self, key: ComponentKey) -> Option<&ComponentStatus> {
        self.components.iter().find(|c| c.key == key)
    }

    pub fn has_failures(&self) -> bool {
        self.components.iter().any(|c| c.health == Health::Failed)
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct KeyRecord {
    source: PathBuf,
    source_present: bool,
    health: Health,
    last_applied: Option<AppliedRecord>,
    last_attempts: u32,
    last_retry_delays_ms: Vec<u64>,
    last_error: Option<String>,
    writes: u64,
}

#[derive(Debug, Default)]
struct BoardState {
    watch_mode: Option<WatchMode>,
    watch_restarts: u32,
    watch_error: Option<String>,
    keys: BTreeMap<ComponentKey, KeyRecord>,
}

#[derive(Debug, Default)]
pub(crate) struct StatusBoard {
    inner: RwLock<BoardState>,
}

impl StatusBoard {
    /// Reset for a new run. Last applied values are seeded from `artifact`.
    pub async fn reset(&self, bindings: &[SourceBinding], artifact: Option<&Artifact>) {
        let mut state = self.inner.write().await;
        *state = BoardState::default();
        for binding in bindings {
            let last_applied = artifact
                .and_then(|a| a.get(binding.key))
                .filter(|entry| !entry.content.is_empty())
                .map(|entry| AppliedRecord {
                    hash: entry.hash.clone(),
                    updated_at: entry.updated_at,
                    written: false,
                });
            state.keys.insert(
                binding.key,
                KeyRecord {
                    source: binding.path.clone(),
                    source_present: binding.path.is_file(),
                    health: Health::Idle,
                    last_applied,
                    last_attempts: 0,
                    last_retry_delays_ms: Vec::new(),
                    last_error: None,
                    writes: 0,
                },
            );
        }
    }

    pub async fn set_source_present(&self, key: ComponentKey, present: bool) {
        if let Some(record) = self.inner.write().await.keys.get_mut(&key) {
            record.source_present = present;
        }
    }

    pub async fn record_success(&self, key: ComponentKey, retried: &Retried<Verified>) {
        let mut state = self.inner.write().await;
        let Some(record) = state.keys.get_mut(&key) else {
            return;
        };
        record.health = Health::Synced;
        record.last_applied = Some(AppliedRecord {
            hash: retried.value.hash.clone(),
            updated_at: retried.value.updated_at,
            written: matches!(retried.value.write, WriteResult::Written { .. }),
        });
        record.last_attempts = retried.attempts;
        record.last_retry_delays_ms = millis(&retried.delays);
        record.last_error = None;
        record.writes += 1;
    }

    pub async fn record_failure(&self, key: ComponentKey, err: &RetryError) {
        let mut state = self.inner.write().await;
        let Some(record) = state.keys.get_mut(&key) else {
            return;
        };
        record.health = Health::Failed;
        record.last_attempts = err.attempts();
        record.last_retry_delays_ms = millis(err.delays());
        record.last_error = Some(err.to_string());
    }

    /// The write task itself died (panic in the blocking pool).
    pub async fn record_crash(&self, key: ComponentKey, reason: String) {
        let mut state = self.inner.write().await;
        if let Some(record) = state.keys.get_mut(&key) {
            record.health = Health::Failed;
            record.last_error = Some(reason);
        }
    }

    pub async fn set_watch(&self, mode: WatchMode, restarts: u32) {
        let mut state = self.inner.write().await;
        state.watch_mode = Some(mode);
        state.watch_restarts = restarts;
    }

    pub async fn record_watch_error(&self, reason: String) {
        self.inner.write().await.watch_error = Some(reason);
    }

    pub async fn set_watch_restarts(&self, restarts: u32) {
        self.inner.write().await.watch_restarts = restarts;
    }

    pub async fn snapshot(&self, engine: EngineState, queue: QueueSnapshot) -> EngineStatus {
        let state = self.inner.read().await;
        let components = state
            .keys
            .iter()
            .map(|(key, record)| ComponentStatus {
                key: *key,
                source: record.source.clone(),
                source_present: record.source_present,
                pending: queue.pending.contains(key),
                in_flight: queue.in_flight.contains(key),
                health: record.health,
                last_applied: record.last_applied.clone(),
                last_attempts: record.last_attempts,
                last_retry_delays_ms: record.last_retry_delays_ms.clone(),
                last_error: record.last_error.clone(),
                writes: record.writes,
            })
            .collect();

        EngineStatus {
            state: engine,
            watch: WatchStatus {
                mode: state.watch_mode,
                restarts: state.watch_restarts,
                last_error: state.watch_error.clone(),
            },
            components,
        }
    }
}

fn millis(delays: &[std::time::Duration]) -> Vec<u64> {
    delays
        .iter()
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .collect()
}
