//! Artifact document persistence.
//!
//! ## `write_section` protocol
//!
//! 1. Normalise and SHA-256 hash the requested content.
//! 2. Take the process-wide write lock for the artifact path.
//! 3. Load the current document (missing file = empty document).
//! 4. Compare with the stored section → `Unchanged` only if both its hash
//!    and its content match.
//! 5. Merge the section and write the whole document to a temp file in the
//!    artifact's directory, then flush and `fsync` it.
//! 6. Rename over the live path (atomic on POSIX).
//!
//! The temp file is removed on every failing exit path; the live artifact is
//! never opened for writing.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use chrono::Utc;

use ctxsync_core::{Artifact, ArtifactEntry, ComponentKey};

use crate::error::{io_err, write_err, StoreError};
use crate::hash::{content_hash, normalize};

const TMP_SUFFIX: &str = ".ctxsync.tmp";

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of an individual section write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// The document was rewritten with the new section.
    Written { hash: String },
    /// Skipped because the stored section already holds the content.
    Unchanged { hash: String },
}

impl WriteResult {
    pub fn hash(&self) -> &str {
        match self {
            WriteResult::Written { hash } | WriteResult::Unchanged { hash } => hash,
        }
    }
}

/// What [`ArtifactStore::prime`] had to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimeOutcome {
    /// The artifact did not exist and was created.
    pub created: bool,
    /// Sections added for newly bound keys.
    pub added: Vec<ComponentKey>,
    /// Leftover temp files removed.
    pub swept: usize,
}

// ---------------------------------------------------------------------------
// SectionStore
// ---------------------------------------------------------------------------

/// Section-level access to the artifact.
pub trait SectionStore: Send + Sync {
    /// Merge `content` into the section for `key`.
    fn write_section(&self, key: ComponentKey, content: &str) -> Result<WriteResult, StoreError>;

    /// Re-read the section for `key` from durable storage.
    fn read_section(&self, key: ComponentKey) -> Result<Option<ArtifactEntry>, StoreError>;
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

/// The JSON artifact on disk.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl ArtifactStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = process_lock(&path);
        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. Returns `None` if the file does not exist yet.
    pub fn load(&self) -> Result<Option<Artifact>, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(&self.path, err)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Ensure the artifact exists with a section for every key in `keys`.
    ///
    /// Existing sections are never touched. Temp files left behind by an
    /// interrupted writer are removed first. A malformed artifact is an error
    /// and is left as-is.
    pub fn prime(&self, keys: &[ComponentKey]) -> Result<PrimeOutcome, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut outcome = PrimeOutcome {
            swept: self.sweep_stale_tmp()?,
            ..PrimeOutcome::default()
        };

        let mut artifact = match self.load()? {
            Some(artifact) => artifact,
            None => {
                outcome.created = true;
                Artifact::empty()
            }
        };

        let now = Utc::now();
        for key in keys {
            if artifact.components.contains_key(key) {
                continue;
            }
            artifact.components.insert(
                *key,
                ArtifactEntry {
                    content: String::new(),
                    hash: content_hash(""),
                    updated_at: now,
                },
            );
            outcome.added.push(*key);
        }

        if outcome.created || !outcome.added.is_empty() {
            artifact.updated_at = now;
            self.persist(&artifact)?;
            tracing::info!(
                "primed artifact {} (created: {}, added: {:?})",
                self.path.display(),
                outcome.created,
                outcome.added
            );
        }
        Ok(outcome)
    }

    fn persist(&self, artifact: &Artifact) -> Result<(), StoreError> {
        let mut json = serde_json::to_string_pretty(artifact)?;
        json.push('\n');
        let tmp = tmp_path_for(&self.path);
        persist_with(&self.path, &tmp, |file| file.write_all(json.as_bytes()))
    }

    fn sweep_stale_tmp(&self) -> Result<usize, StoreError> {
        let Some(dir) = self.path.parent() else {
            return Ok(0);
        };
        let Some(prefix) = tmp_prefix(&self.path) else {
            return Ok(0);
        };
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(io_err(dir, err)),
        };

        let mut swept = 0;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(dir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(TMP_SUFFIX) {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        tracing::warn!("removed stale temp file {}", entry.path().display());
                        swept += 1;
                    }
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(io_err(entry.path(), err)),
                }
            }
        }
        Ok(swept)
    }
}

impl SectionStore for ArtifactStore {
    fn write_section(&self, key: ComponentKey, content: &str) -> Result<WriteResult, StoreError> {
        let content = normalize(content);
        let digest = content_hash(&content);

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut artifact = self.load()?.unwrap_or_default();

        if let Some(stored) = artifact.components.get(&key) {
            // A stale hash next to edited content must not block a rewrite.
            if stored.hash == digest && stored.content == content {
                tracing::debug!("unchanged: {key} in {}", self.path.display());
                return Ok(WriteResult::Unchanged { hash: digest });
            }
        }

        let now = Utc::now();
        artifact.components.insert(
            key,
            ArtifactEntry {
                content: content.into_owned(),
                hash: digest.clone(),
                updated_at: now,
            },
        );
        artifact.updated_at = now;
        self.persist(&artifact)?;

        tracing::info!("wrote: {key} -> {}", self.path.display());
        Ok(WriteResult::Written { hash: digest })
    }

    fn read_section(&self, key: ComponentKey) -> Result<Option<ArtifactEntry>, StoreError> {
        Ok(self
            .load()?
            .and_then(|mut artifact| artifact.components.remove(&key)))
    }
}

// ---------------------------------------------------------------------------
// Atomic persistence
// ---------------------------------------------------------------------------

/// One lock per artifact path for the whole process, so two stores pointing
/// at the same file still serialize their temp-write + rename sequences.
fn process_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    locks.entry(path.to_path_buf()).or_default().clone()
}

fn tmp_prefix(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| format!(".{}.", name.to_string_lossy()))
}

/// `<dir>/.<file_name>.<pid>.<seq>.ctxsync.tmp`
fn tmp_path_for(path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let prefix = tmp_prefix(path).unwrap_or_else(|| ".artifact.".to_string());
    let name = format!("{prefix}{}.{seq}{TMP_SUFFIX}", std::process::id());
    match path.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

/// Removes the temp path on drop unless disarmed after a successful rename.
struct TempGuard<'a> {
    path: &'a Path,
    armed: bool,
}

impl<'a> TempGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(self.path);
        }
    }
}

pub(crate) fn persist_with<F>(path: &Path, tmp: &Path, write: F) -> Result<(), StoreError>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| write_err(dir, e))?;
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp)
        .map_err(|e| write_err(tmp, e))?;
    let guard = TempGuard::new(tmp);

    write(&mut file).map_err(|e| write_err(tmp, e))?;
    file.flush().map_err(|e| write_err(tmp, e))?;
    file.sync_all().map_err(|e| write_err(tmp, e))?;
    drop(file);

    std::fs::rename(tmp, path).map_err(|e| write_err(path, e))?;
    guard.disarm();

    if let Some(dir) = path.parent() {
        sync_dir(dir);
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> ArtifactStore {
        ArtifactStore::new(dir.path().join("rules").join("context.json"))
    }

    fn tmp_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.to_string_lossy().ends_with(TMP_SUFFIX))
            .collect()
    }

    #[test]
    fn first_write_returns_written_and_creates_parents() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let result = store
            .write_section(ComponentKey::Architecture, "# A")
            .unwrap();
        assert!(matches!(result, WriteResult::Written { .. }));
        assert!(store.path().exists());
        let entry = store
            .read_section(ComponentKey::Architecture)
            .unwrap()
            .expect("section");
        assert_eq!(entry.content, "# A");
        assert_eq!(entry.hash, content_hash("# A"));
    }

    #[test]
    fn second_write_same_content_returns_unchanged() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.write_section(ComponentKey::Progress, "same").unwrap();
        let before = store.load().unwrap().expect("artifact");

        let result = store.write_section(ComponentKey::Progress, "same").unwrap();
        assert!(matches!(result, WriteResult::Unchanged { .. }));
        let after = store.load().unwrap().expect("artifact");
        assert_eq!(after, before, "unchanged write must not touch the document");
    }

    #[test]
    fn edited_content_under_a_matching_hash_is_rewritten() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.write_section(ComponentKey::Progress, "v1").unwrap();

        let mut artifact = store.load().unwrap().expect("artifact");
        if let Some(entry) = artifact.components.get_mut(&ComponentKey::Progress) {
            entry.content = "tampered".to_string();
        }
        fs::write(store.path(), serde_json::to_string(&artifact).unwrap()).unwrap();

        let result = store.write_section(ComponentKey::Progress, "v1").unwrap();
        assert!(matches!(result, WriteResult::Written { .. }), "got: {result:?}");
        let entry = store.read_section(ComponentKey::Progress).unwrap().unwrap();
        assert_eq!(entry.content, "v1");
        assert_eq!(entry.hash, content_hash("v1"));
    }

    #[test]
    fn writing_one_section_preserves_the_others() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.write_section(ComponentKey::Architecture, "arch").unwrap();
        store.write_section(ComponentKey::Tasks, "tasks v1").unwrap();
        store.write_section(ComponentKey::Tasks, "tasks v2").unwrap();

        let artifact = store.load().unwrap().expect("artifact");
        assert_eq!(artifact.get(ComponentKey::Architecture).unwrap().content, "arch");
        assert_eq!(artifact.get(ComponentKey::Tasks).unwrap().content, "tasks v2");
        assert!(artifact.get(ComponentKey::Progress).is_none());
    }

    #[test]
    fn tmp_file_removed_after_write() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.write_section(ComponentKey::Tasks, "data").unwrap();
        let dir = store.path().parent().unwrap();
        assert!(tmp_files(dir).is_empty(), "temp files must be renamed away");
    }

    #[test]
    fn crlf_content_is_stored_with_lf() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let first = store
            .write_section(ComponentKey::Progress, "line1\r\nline2\r\n")
            .unwrap();
        assert!(matches!(first, WriteResult::Written { .. }));
        let second = store
            .write_section(ComponentKey::Progress, "line1\nline2\n")
            .unwrap();
        assert!(matches!(second, WriteResult::Unchanged { .. }));
        let entry = store.read_section(ComponentKey::Progress).unwrap().unwrap();
        assert_eq!(entry.content, "line1\nline2\n");
    }

    #[test]
    fn failure_during_temp_write_leaves_live_file_and_cleans_tmp() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.write_section(ComponentKey::Architecture, "v1").unwrap();
        let before = fs::read_to_string(store.path()).unwrap();

        let tmp_path = tmp_path_for(store.path());
        let err = persist_with(store.path(), &tmp_path, |file| {
            file.write_all(b"{\"version\": 1, \"compo")?;
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        })
        .expect_err("injected failure");
        assert!(matches!(err, StoreError::Write { .. }), "got: {err}");

        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
        assert!(!tmp_path.exists(), "temp file must be removed on failure");
        let entry = store.read_section(ComponentKey::Architecture).unwrap().unwrap();
        assert_eq!(entry.content, "v1");
    }

    #[test]
    fn rename_failure_cleans_tmp() {
        let tmp = TempDir::new().unwrap();
        // A non-empty directory at the target path makes the rename fail.
        let target = tmp.path().join("context.json");
        fs::create_dir_all(target.join("occupied")).unwrap();

        let tmp_path = tmp_path_for(&target);
        let err = persist_with(&target, &tmp_path, |file| file.write_all(b"{}"))
            .expect_err("rename over a directory should fail");
        assert!(matches!(err, StoreError::Write { .. }), "got: {err}");
        assert!(!tmp_path.exists(), "temp file must be removed on failure");
        assert!(target.join("occupied").is_dir(), "target must be untouched");
    }

    #[test]
    fn prime_creates_missing_artifact_with_empty_sections() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let outcome = store.prime(ComponentKey::all()).unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.added, ComponentKey::all().to_vec());

        let artifact = store.load().unwrap().expect("artifact");
        for key in ComponentKey::all() {
            let entry = artifact.get(*key).expect("section");
            assert_eq!(entry.content, "");
            assert_eq!(entry.hash, content_hash(""));
        }
    }

    #[test]
    fn prime_keeps_existing_sections_and_adds_new_keys() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.write_section(ComponentKey::Architecture, "kept").unwrap();

        let outcome = store
            .prime(&[ComponentKey::Architecture, ComponentKey::Tasks])
            .unwrap();
        assert!(!outcome.created);
        assert_eq!(outcome.added, vec![ComponentKey::Tasks]);
        let artifact = store.load().unwrap().unwrap();
        assert_eq!(artifact.get(ComponentKey::Architecture).unwrap().content, "kept");

        let again = store
            .prime(&[ComponentKey::Architecture, ComponentKey::Tasks])
            .unwrap();
        assert_eq!(again, PrimeOutcome::default(), "second prime is a no-op");
    }

    #[test]
    fn prime_refuses_malformed_artifact() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{ not json").unwrap();

        let err = store.prime(ComponentKey::all()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "got: {err}");
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "{ not json");
    }

    #[test]
    fn prime_sweeps_leftover_temp_files() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.write_section(ComponentKey::Tasks, "t").unwrap();
        let stale = tmp_path_for(store.path());
        fs::write(&stale, "{\"version\":").unwrap();

        let outcome = store.prime(ComponentKey::all()).unwrap();
        assert_eq!(outcome.swept, 1);
        assert!(!stale.exists());
    }

    #[test]
    fn stores_for_same_path_share_one_lock() {
        let tmp = TempDir::new().unwrap();
        let a = store_in(&tmp);
        let b = store_in(&tmp);
        assert!(Arc::ptr_eq(&a.lock, &b.lock));
    }
}
