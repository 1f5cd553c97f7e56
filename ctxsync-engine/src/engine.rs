//! The synchronization engine.
//!
//! Lifecycle: `Stopped → Starting → Running → Stopping → Stopped`.
//!
//! While running, two tasks cooperate:
//! - the **processor** pulls from the [`UpdateQueue`] and runs one
//!   write-and-verify sequence per dequeued key on the blocking pool;
//! - the **watch supervisor** turns source file events into queued updates
//!   and restarts the watch session when it dies.
//!
//! Per-key single flight comes from the queue: a key is not handed out again
//! until the [`InFlightGuard`](crate::queue::InFlightGuard) of its previous
//! update is dropped, which happens only after the result is recorded.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Notify};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use ctxsync_core::{ComponentKey, SourceBinding, SyncConfig};
use ctxsync_store::{
    apply_verified, ArtifactStore, RetryContext, RetryPolicy, SectionStore, WriteResult,
};

use crate::error::EngineError;
use crate::queue::{Dequeued, QueueClosed, UpdateQueue};
use crate::status::{EngineState, EngineStatus, StatusBoard};
use crate::watcher::{SourceChange, WatchOptions, WatchSession};

/// Longest uninterrupted sleep between retry attempts while watching for stop.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

struct RunningEngine {
    queue: UpdateQueue,
    shutdown_tx: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
    processor: JoinHandle<Result<(), EngineError>>,
    supervisor: JoinHandle<Result<(), EngineError>>,
}

struct Lifecycle {
    state: EngineState,
    running: Option<RunningEngine>,
}

/// Keeps the artifact in sync with the bound source files.
///
/// Construct one per artifact and hand it to callers; all operations take
/// `&self`.
pub struct SyncEngine {
    config: SyncConfig,
    bindings: Vec<SourceBinding>,
    store: Arc<dyn SectionStore>,
    artifact: ArtifactStore,
    lifecycle: Arc<Mutex<Lifecycle>>,
    /// Woken whenever `start` leaves the `Starting` state.
    settled: Notify,
    board: Arc<StatusBoard>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Self {
        let store = Arc::new(ArtifactStore::new(config.artifact_path()));
        Self::with_store(config, store)
    }

    /// Use `store` for section writes and verification reads. Priming still
    /// goes to the artifact file at the configured path.
    pub fn with_store(config: SyncConfig, store: Arc<dyn SectionStore>) -> Self {
        let bindings = config.bindings();
        let artifact = ArtifactStore::new(config.artifact_path());
        Self {
            config,
            bindings,
            store,
            artifact,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: EngineState::Stopped,
                running: None,
            })),
            settled: Notify::new(),
            board: Arc::new(StatusBoard::default()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn bindings(&self) -> &[SourceBinding] {
        &self.bindings
    }

    pub fn state(&self) -> EngineState {
        lock(&self.lifecycle).state
    }

    /// Prime the artifact, open the watch session, reconcile every source and
    /// launch the processing tasks.
    ///
    /// Fails with [`EngineError::Config`] before doing anything if the
    /// configuration is invalid. Must be called inside a tokio runtime.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.config.validate()?;
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state != EngineState::Stopped {
                return Err(EngineError::AlreadyRunning);
            }
            lifecycle.state = EngineState::Starting;
        }

        let result = match self.launch().await {
            Ok(running) => {
                let mut lifecycle = lock(&self.lifecycle);
                // The supervisor may already have given up during startup.
                lifecycle.state = if running.stopping.load(Ordering::SeqCst) {
                    EngineState::Stopping
                } else {
                    EngineState::Running
                };
                lifecycle.running = Some(running);
                tracing::info!(
                    artifact = %self.artifact.path().display(),
                    keys = self.bindings.len(),
                    "sync engine running",
                );
                Ok(())
            }
            Err(err) => {
                lock(&self.lifecycle).state = EngineState::Stopped;
                tracing::error!(error = %err, "sync engine failed to start");
                Err(err)
            }
        };
        self.settled.notify_waiters();
        result
    }

    async fn launch(&self) -> Result<RunningEngine, EngineError> {
        let artifact = self.artifact.clone();
        let keys: Vec<ComponentKey> = self.bindings.iter().map(|b| b.key).collect();
        let (primed, loaded) = tokio::task::spawn_blocking(move || {
            let primed = artifact.prime(&keys)?;
            let loaded = artifact.load()?;
            Ok::<_, EngineError>((primed, loaded))
        })
        .await
        .map_err(|err| join_failure("prime", err))??;

        if primed.created {
            tracing::info!(path = %self.artifact.path().display(), "created artifact");
        }
        for key in &primed.added {
            tracing::info!(key = %key, "added artifact section");
        }
        if primed.swept > 0 {
            tracing::warn!(count = primed.swept, "removed leftover temp files");
        }
        self.board.reset(&self.bindings, loaded.as_ref()).await;

        // Watch before reconciling so no edit falls between the two.
        let options = self.watch_options();
        let session = WatchSession::open(&self.bindings, options)?;
        self.board.set_watch(session.mode(), 0).await;

        let queue = UpdateQueue::new(self.config.debounce());
        let (shutdown_tx, _) = broadcast::channel::<()>(4);
        let stopping = Arc::new(AtomicBool::new(false));

        let sources = SourceFeed {
            bindings: self.bindings.clone(),
            queue: queue.clone(),
            board: self.board.clone(),
        };
        sources.reconcile().await;

        let processor = {
            let worker = Worker {
                queue: queue.clone(),
                store: self.store.clone(),
                policy: RetryPolicy::from_settings(&self.config.retry),
                stopping: stopping.clone(),
                board: self.board.clone(),
            };
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move { processor_task(worker, shutdown).await })
        };

        let supervisor = {
            let supervisor = WatchSupervisor {
                sources,
                options,
                restart_limit: self.config.watch_restart_limit,
                restart_delay: self.config.watch_restart_delay(),
                lifecycle: self.lifecycle.clone(),
                stopping: stopping.clone(),
                shutdown_tx: shutdown_tx.clone(),
            };
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move { supervisor.run(session, shutdown).await })
        };

        Ok(RunningEngine {
            queue,
            shutdown_tx,
            stopping,
            processor,
            supervisor,
        })
    }

    /// Stop processing and release the watch.
    ///
    /// Pending updates are discarded; an update already in flight finishes
    /// its current attempt. Calling `stop` on a stopped engine is a no-op.
    /// A `start` still in progress is waited for and then stopped.
    /// Returns the watch failure if the engine stopped itself.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let running = loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            {
                let mut lifecycle = lock(&self.lifecycle);
                if lifecycle.state != EngineState::Starting {
                    let Some(running) = lifecycle.running.take() else {
                        return Ok(());
                    };
                    lifecycle.state = EngineState::Stopping;
                    break running;
                }
            }
            settled.await;
        };

        running.stopping.store(true, Ordering::SeqCst);
        let discarded = running.queue.close();
        if discarded > 0 {
            tracing::info!(discarded, "discarded pending updates on stop");
        }
        let _ = running.shutdown_tx.send(());

        let (processor, supervisor) = tokio::join!(running.processor, running.supervisor);
        lock(&self.lifecycle).state = EngineState::Stopped;
        tracing::info!("sync engine stopped");

        handle_join("processor", processor)?;
        handle_join("watch supervisor", supervisor)
    }

    /// Request an update of `key`. Returns once the update is accepted, not
    /// once it is applied.
    pub fn queue_update(
        &self,
        key: ComponentKey,
        content: impl Into<String>,
    ) -> Result<(), EngineError> {
        let queue = {
            let lifecycle = lock(&self.lifecycle);
            match (&lifecycle.state, &lifecycle.running) {
                (EngineState::Running, Some(running)) => running.queue.clone(),
                _ => return Err(EngineError::NotRunning),
            }
        };
        if !self.bindings.iter().any(|b| b.key == key) {
            return Err(EngineError::UnknownKey(key));
        }
        queue
            .enqueue(key, content)
            .map(|_| ())
            .map_err(|QueueClosed| EngineError::NotRunning)
    }

    pub async fn status(&self) -> EngineStatus {
        let (state, queue) = {
            let lifecycle = lock(&self.lifecycle);
            let queue = lifecycle
                .running
                .as_ref()
                .map(|running| running.queue.snapshot())
                .unwrap_or_default();
            (lifecycle.state, queue)
        };
        self.board.snapshot(state, queue).await
    }

    /// Resolve once nothing is pending or in flight and every processed
    /// update has recorded its status. Returns immediately when stopped.
    pub async fn wait_idle(&self) {
        let queue = lock(&self.lifecycle)
            .running
            .as_ref()
            .map(|running| running.queue.clone());
        if let Some(queue) = queue {
            queue.wait_idle().await;
        }
    }

    /// Resolve once the engine begins stopping, whether through [`stop`] or
    /// because the watch could not be restarted.
    ///
    /// [`stop`]: SyncEngine::stop
    pub async fn closed(&self) {
        let (mut shutdown_rx, stopping) = {
            let lifecycle = lock(&self.lifecycle);
            let Some(running) = lifecycle.running.as_ref() else {
                return;
            };
            (running.shutdown_tx.subscribe(), running.stopping.clone())
        };
        if stopping.load(Ordering::SeqCst) {
            return;
        }
        let _ = shutdown_rx.recv().await;
    }

    fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            poll_interval: self.config.poll_interval(),
            force_polling: self.config.force_polling,
        }
    }
}

// ---------------------------------------------------------------------------
// Processing loop
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Worker {
    queue: UpdateQueue,
    store: Arc<dyn SectionStore>,
    policy: RetryPolicy,
    stopping: Arc<AtomicBool>,
    board: Arc<StatusBoard>,
}

async fn processor_task(
    worker: Worker,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), EngineError> {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            next = worker.queue.dequeue() => {
                let Some(item) = next else { break };
                tasks.spawn(apply_update(worker.clone(), item));
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                log_task_exit(joined);
            }
        }
    }

    // In-flight sequences stop at their next retry boundary.
    while let Some(joined) = tasks.join_next().await {
        log_task_exit(joined);
    }
    Ok(())
}

async fn apply_update(worker: Worker, item: Dequeued) {
    let (update, guard) = item.into_parts();
    let key = update.key;
    let waited = update.enqueued_at.elapsed();
    tracing::debug!(
        key = %key,
        superseded = update.superseded,
        waited_ms = waited.as_millis() as u64,
        "applying update",
    );

    let store = worker.store.clone();
    let policy = worker.policy;
    let stopping = worker.stopping.clone();
    let content = update.content;
    let outcome = tokio::task::spawn_blocking(move || {
        let mut ctx = StopAwareSleep { stopping };
        policy.run(&mut ctx, |attempt| {
            tracing::debug!(key = %key, attempt, "write attempt");
            apply_verified(store.as_ref(), key, &content)
        })
    })
    .await;

    match outcome {
        Ok(Ok(retried)) => {
            tracing::info!(
                key = %key,
                hash = %retried.value.hash,
                attempts = retried.attempts,
                written = matches!(retried.value.write, WriteResult::Written { .. }),
                "section synced",
            );
            worker.board.record_success(key, &retried).await;
        }
        Ok(Err(err)) => {
            tracing::error!(key = %key, attempts = err.attempts(), error = %err, "section update failed");
            worker.board.record_failure(key, &err).await;
        }
        Err(err) => {
            tracing::error!(key = %key, error = %err, "write task failed");
            worker.board.record_crash(key, err.to_string()).await;
        }
    }

    // Release the key only after its status is recorded.
    drop(guard);
}

fn log_task_exit(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        tracing::error!(error = %err, "update task aborted");
    }
}

/// Retry sleep that wakes early once stop begins.
struct StopAwareSleep {
    stopping: Arc<AtomicBool>,
}

impl RetryContext for StopAwareSleep {
    fn is_cancelled(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn sleep(&mut self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while !self.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

// ---------------------------------------------------------------------------
// Source feed and watch supervision
// ---------------------------------------------------------------------------

/// Reads source files and feeds their content into the queue.
#[derive(Clone)]
struct SourceFeed {
    bindings: Vec<SourceBinding>,
    queue: UpdateQueue,
    board: Arc<StatusBoard>,
}

impl SourceFeed {
    /// Enqueue the current content of every source that exists.
    async fn reconcile(&self) {
        for binding in &self.bindings {
            self.refresh(binding.key, &binding.path).await;
        }
    }

    async fn refresh(&self, key: ComponentKey, path: &std::path::Path) {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                self.board.set_source_present(key, true).await;
                if self.queue.enqueue(key, content).is_err() {
                    tracing::debug!(key = %key, "queue closed, dropping source change");
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.board.set_source_present(key, false).await;
                tracing::debug!(key = %key, path = %path.display(), "source file missing");
            }
            Err(err) => {
                tracing::warn!(key = %key, path = %path.display(), error = %err, "cannot read source file");
            }
        }
    }

    async fn apply(&self, change: SourceChange) {
        match change {
            SourceChange::Changed { key, path } => self.refresh(key, &path).await,
            SourceChange::Removed { key, path } => {
                // Keep the last verified section; only the status changes.
                tracing::info!(key = %key, path = %path.display(), "source file removed");
                self.board.set_source_present(key, false).await;
            }
        }
    }
}

struct WatchSupervisor {
    sources: SourceFeed,
    options: WatchOptions,
    restart_limit: u32,
    restart_delay: Duration,
    lifecycle: Arc<Mutex<Lifecycle>>,
    stopping: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WatchSupervisor {
    async fn run(
        self,
        initial: WatchSession,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), EngineError> {
        let mut session = Some(initial);
        let mut restarts = 0u32;

        loop {
            let failure = match session.take() {
                Some(mut active) => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => return Ok(()),
                        failure = self.pump(&mut active) => failure,
                    }
                }
                None => match WatchSession::open(&self.sources.bindings, self.options) {
                    Ok(fresh) => {
                        tracing::info!(restarts, mode = ?fresh.mode(), "watch session restarted");
                        self.sources.board.set_watch(fresh.mode(), restarts).await;
                        // Catch edits made while nothing was watching.
                        self.sources.reconcile().await;
                        session = Some(fresh);
                        continue;
                    }
                    Err(err) => err,
                },
            };

            self.sources.board.record_watch_error(failure.to_string()).await;
            if restarts >= self.restart_limit {
                tracing::error!(
                    restarts,
                    error = %failure,
                    "watch cannot be restarted, stopping engine",
                );
                self.begin_stop();
                return Err(failure);
            }

            restarts += 1;
            self.sources.board.set_watch_restarts(restarts).await;
            tracing::warn!(
                error = %failure,
                attempt = restarts,
                limit = self.restart_limit,
                delay_ms = self.restart_delay.as_millis() as u64,
                "watch failed, restarting",
            );
            tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
        }
    }

    /// Forward changes until the session dies.
    async fn pump(&self, session: &mut WatchSession) -> EngineError {
        loop {
            match session.next_changes().await {
                Ok(changes) => {
                    for change in changes {
                        self.sources.apply(change).await;
                    }
                }
                Err(err) => return err,
            }
        }
    }

    fn begin_stop(&self) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state == EngineState::Running {
                lifecycle.state = EngineState::Stopping;
            }
        }
        self.stopping.store(true, Ordering::SeqCst);
        self.sources.queue.close();
        let _ = self.shutdown_tx.send(());
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn lock(lifecycle: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
}

fn join_failure(task: &'static str, err: JoinError) -> EngineError {
    EngineError::Join {
        task,
        reason: err.to_string(),
    }
}

fn handle_join(
    task: &'static str,
    result: Result<Result<(), EngineError>, JoinError>,
) -> Result<(), EngineError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(join_failure(task, err)),
    }
}
