//! Source file watching.
//!
//! A [`WatchSession`] watches the parent directory of every bound source file
//! (non-recursive) and maps events back to component keys. Directory watches
//! survive editors that save by writing a new file and renaming it over the
//! old one.
//!
//! The notify callback runs on notify's own thread and only pushes the raw
//! event into an unbounded channel, so it never blocks on I/O.
//!
//! Falls back to [`PollWatcher`] when the platform watcher cannot be created
//! or refuses a directory. A session ends with a `WatchFailure` when its
//! handle dies: event channel closed, fatal notify error, or a watched
//! directory disappearing.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{
    recommended_watcher, Config as NotifyConfig, Event, EventKind, PollWatcher, RecursiveMode,
    Watcher,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

use ctxsync_core::{ComponentKey, SourceBinding};

use crate::error::{watch_failure, EngineError};

/// Which notification facility a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    Native,
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Interval for the polling fallback and for directory health checks.
    pub poll_interval: Duration,
    /// Skip the native watcher entirely.
    pub force_polling: bool,
}

/// A change to one bound source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceChange {
    /// Created or modified; the content should be re-read.
    Changed { key: ComponentKey, path: PathBuf },
    /// Deleted or renamed away.
    Removed { key: ComponentKey, path: PathBuf },
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

struct WatchTargets {
    by_path: HashMap<PathBuf, ComponentKey>,
    dirs: BTreeSet<PathBuf>,
    bindings: Vec<SourceBinding>,
}

impl WatchTargets {
    fn new(bindings: &[SourceBinding]) -> Result<Self, EngineError> {
        let mut by_path = HashMap::new();
        let mut dirs = BTreeSet::new();

        for binding in bindings {
            let (Some(parent), Some(name)) = (binding.path.parent(), binding.path.file_name())
            else {
                return Err(watch_failure(format!(
                    "source path for '{}' has no parent directory: {}",
                    binding.key,
                    binding.path.display()
                )));
            };
            // Events carry resolved paths (symlinked temp dirs on macOS).
            let dir = fs::canonicalize(parent).map_err(|err| {
                watch_failure(format!(
                    "cannot watch {} for '{}': {err}",
                    parent.display(),
                    binding.key
                ))
            })?;
            by_path.insert(dir.join(name), binding.key);
            by_path.insert(binding.path.clone(), binding.key);
            dirs.insert(dir);
        }

        Ok(Self {
            by_path,
            dirs,
            bindings: bindings.to_vec(),
        })
    }

    fn key_for(&self, path: &Path) -> Option<ComponentKey> {
        if let Some(key) = self.by_path.get(path) {
            return Some(*key);
        }
        let parent = fs::canonicalize(path.parent()?).ok()?;
        self.by_path.get(&parent.join(path.file_name()?)).copied()
    }

    fn path_for(&self, key: ComponentKey) -> Option<&Path> {
        self.bindings
            .iter()
            .find(|binding| binding.key == key)
            .map(|binding| binding.path.as_path())
    }

    fn missing_dir(&self) -> Option<&Path> {
        self.dirs
            .iter()
            .find(|dir| !dir.is_dir())
            .map(PathBuf::as_path)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct WatchSession {
    _watcher: Box<dyn Watcher + Send>,
    mode: WatchMode,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    targets: WatchTargets,
    health: Interval,
}

impl WatchSession {
    /// Establish watches for every binding. Must be called inside a tokio
    /// runtime.
    pub fn open(bindings: &[SourceBinding], options: WatchOptions) -> Result<Self, EngineError> {
        let targets = WatchTargets::new(bindings)?;
        let (event_tx, events) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let (watcher, mode) = if options.force_polling {
            (polling_watcher(event_tx, &targets, options)?, WatchMode::Polling)
        } else {
            match native_watcher(event_tx.clone(), &targets) {
                Ok(watcher) => (watcher, WatchMode::Native),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        poll_interval_ms = options.poll_interval.as_millis() as u64,
                        "native watcher unavailable, falling back to polling",
                    );
                    (polling_watcher(event_tx, &targets, options)?, WatchMode::Polling)
                }
            }
        };

        let mut health = tokio::time::interval(options.poll_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);
        health.reset();

        for dir in &targets.dirs {
            tracing::debug!(path = %dir.display(), mode = ?mode, "watching source directory");
        }

        Ok(Self {
            _watcher: watcher,
            mode,
            events,
            targets,
            health,
        })
    }

    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    /// Wait for the next batch of relevant source changes.
    ///
    /// An `Err` means the session is dead and must be replaced.
    pub async fn next_changes(&mut self) -> Result<Vec<SourceChange>, EngineError> {
        loop {
            tokio::select! {
                _ = self.health.tick() => {
                    if let Some(dir) = self.targets.missing_dir() {
                        return Err(watch_failure(format!(
                            "watched directory removed: {}",
                            dir.display()
                        )));
                    }
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        return Err(watch_failure("watcher event channel closed"));
                    };
                    let changes = self.handle(event)?;
                    if !changes.is_empty() {
                        return Ok(changes);
                    }
                }
            }
        }
    }

    fn handle(&self, event: notify::Result<Event>) -> Result<Vec<SourceChange>, EngineError> {
        match event {
            Ok(event) => self.classify(event),
            Err(err) if self.is_fatal(&err) => Err(watch_failure(err.to_string())),
            Err(err) => {
                tracing::warn!(error = %err, paths = ?err.paths, "watcher event error");
                Ok(Vec::new())
            }
        }
    }

    /// Errors that mean the watch itself is gone.
    ///
    /// A file vanishing between a directory scan and its stat is routine
    /// while editors swap temp files; only a missing watched directory counts.
    fn is_fatal(&self, err: &notify::Error) -> bool {
        match &err.kind {
            notify::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::NotFound => err
                .paths
                .iter()
                .any(|path| self.targets.dirs.contains(path)),
            notify::ErrorKind::Io(_)
            | notify::ErrorKind::WatchNotFound
            | notify::ErrorKind::MaxFilesWatch => true,
            _ => false,
        }
    }

    fn classify(&self, event: Event) -> Result<Vec<SourceChange>, EngineError> {
        if event.need_rescan() {
            tracing::info!("watcher requested rescan; re-reading every source");
            return Ok(self
                .targets
                .bindings
                .iter()
                .map(|binding| SourceChange::Changed {
                    key: binding.key,
                    path: binding.path.clone(),
                })
                .collect());
        }

        let removed = matches!(event.kind, EventKind::Remove(_));
        if removed {
            if let Some(dir) = event.paths.iter().find(|p| self.targets.dirs.contains(*p)) {
                return Err(watch_failure(format!(
                    "watched directory removed: {}",
                    dir.display()
                )));
            }
        }
        if !is_relevant_event_kind(&event.kind) {
            return Ok(Vec::new());
        }

        let mut changes = Vec::new();
        for path in &event.paths {
            let Some(key) = self.targets.key_for(path) else {
                continue;
            };
            let Some(bound) = self.targets.path_for(key) else {
                continue;
            };
            let change = if removed {
                SourceChange::Removed {
                    key,
                    path: bound.to_path_buf(),
                }
            } else {
                SourceChange::Changed {
                    key,
                    path: bound.to_path_buf(),
                }
            };
            if !changes.contains(&change) {
                changes.push(change);
            }
        }
        Ok(changes)
    }
}

fn native_watcher(
    event_tx: mpsc::UnboundedSender<notify::Result<Event>>,
    targets: &WatchTargets,
) -> Result<Box<dyn Watcher + Send>, EngineError> {
    let mut watcher = recommended_watcher(move |event: notify::Result<Event>| {
        let _ = event_tx.send(event);
    })?;
    for dir in &targets.dirs {
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
    }
    Ok(Box::new(watcher))
}

fn polling_watcher(
    event_tx: mpsc::UnboundedSender<notify::Result<Event>>,
    targets: &WatchTargets,
    options: WatchOptions,
) -> Result<Box<dyn Watcher + Send>, EngineError> {
    let config = NotifyConfig::default().with_poll_interval(options.poll_interval);
    let mut watcher = PollWatcher::new(
        move |event: notify::Result<Event>| {
            let _ = event_tx.send(event);
        },
        config,
    )?;
    for dir in &targets.dirs {
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
    }
    Ok(Box::new(watcher))
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};
    use tempfile::TempDir;

    fn bindings(dir: &Path) -> Vec<SourceBinding> {
        vec![
            SourceBinding::new(ComponentKey::Architecture, dir.join("architecture.md")),
            SourceBinding::new(ComponentKey::Progress, dir.join("progress.md")),
        ]
    }

    fn options() -> WatchOptions {
        WatchOptions {
            poll_interval: Duration::from_millis(50),
            force_polling: true,
        }
    }

    #[tokio::test]
    async fn events_for_bound_files_map_to_keys() {
        let dir = TempDir::new().expect("tempdir");
        let session = WatchSession::open(&bindings(dir.path()), options()).expect("open");
        assert_eq!(session.mode(), WatchMode::Polling);

        let event = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(dir.path().join("progress.md"))
            .add_path(dir.path().join("unrelated.md"));
        let changes = session.classify(event).expect("classify");
        assert_eq!(
            changes,
            vec![SourceChange::Changed {
                key: ComponentKey::Progress,
                path: dir.path().join("progress.md"),
            }]
        );
    }

    #[tokio::test]
    async fn remove_of_bound_file_is_reported_not_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let session = WatchSession::open(&bindings(dir.path()), options()).expect("open");
        let event = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(dir.path().join("architecture.md"));
        let changes = session.classify(event).expect("classify");
        assert!(matches!(
            changes.as_slice(),
            [SourceChange::Removed {
                key: ComponentKey::Architecture,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn remove_of_watched_directory_is_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let session = WatchSession::open(&bindings(dir.path()), options()).expect("open");
        let canonical = fs::canonicalize(dir.path()).expect("canonicalize");
        let event = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(canonical);
        let err = session.classify(event).unwrap_err();
        assert!(matches!(err, EngineError::WatchFailure { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn access_events_are_ignored() {
        let dir = TempDir::new().expect("tempdir");
        let session = WatchSession::open(&bindings(dir.path()), options()).expect("open");
        let event = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(dir.path().join("progress.md"));
        assert!(session.classify(event).expect("classify").is_empty());
    }

    #[tokio::test]
    async fn vanished_temp_file_is_not_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let session = WatchSession::open(&bindings(dir.path()), options()).expect("open");
        let err = notify::Error::io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "No such file or directory",
        ))
        .add_path(dir.path().join(".progress.md.swp"));
        let changes = session.handle(Err(err)).expect("session survives");
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn io_errors_on_the_watch_itself_are_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let session = WatchSession::open(&bindings(dir.path()), options()).expect("open");
        let canonical = fs::canonicalize(dir.path()).expect("canonicalize");

        let gone = notify::Error::io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
            .add_path(canonical);
        assert!(session.handle(Err(gone)).is_err());

        let denied = notify::Error::io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(session.handle(Err(denied)).is_err());
        assert!(session
            .handle(Err(notify::Error::generic("transient")))
            .expect("generic errors are logged")
            .is_empty());
    }

    #[tokio::test]
    async fn missing_source_directory_fails_to_open() {
        let dir = TempDir::new().expect("tempdir");
        let missing = vec![SourceBinding::new(
            ComponentKey::Tasks,
            dir.path().join("nope").join("tasks.md"),
        )];
        let err = WatchSession::open(&missing, options()).err().expect("must fail");
        assert!(matches!(err, EngineError::WatchFailure { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn polling_session_sees_a_new_file() {
        let dir = TempDir::new().expect("tempdir");
        let mut session = WatchSession::open(&bindings(dir.path()), options()).expect("open");
        // Let the poller take its initial snapshot.
        tokio::time::sleep(Duration::from_millis(120)).await;
        fs::write(dir.path().join("architecture.md"), "# A").expect("write");

        let changes = tokio::time::timeout(Duration::from_secs(5), session.next_changes())
            .await
            .expect("change within timeout")
            .expect("healthy session");
        assert!(changes.iter().any(|c| matches!(
            c,
            SourceChange::Changed {
                key: ComponentKey::Architecture,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn deleting_the_watched_directory_ends_the_session() {
        let root = TempDir::new().expect("tempdir");
        let docs = root.path().join("docs");
        fs::create_dir_all(&docs).expect("mkdir");
        let mut session = WatchSession::open(&bindings(&docs), options()).expect("open");

        fs::remove_dir_all(&docs).expect("remove docs");
        let outcome = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match session.next_changes().await {
                    Ok(_) => continue,
                    Err(err) => return err,
                }
            }
        })
        .await
        .expect("failure within timeout");
        assert!(matches!(outcome, EngineError::WatchFailure { .. }));
    }

    #[test]
    fn create_events_are_relevant() {
        assert!(is_relevant_event_kind(&EventKind::Create(CreateKind::File)));
        assert!(!is_relevant_event_kind(&EventKind::Other));
    }
}
