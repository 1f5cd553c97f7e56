//! Post-write verification.
//!
//! A write only counts once the value read back from durable storage equals
//! the requested content. A mismatch is an ordinary failed attempt.

use chrono::{DateTime, Utc};

use ctxsync_core::{ArtifactEntry, ComponentKey};

use crate::artifact::{SectionStore, WriteResult};
use crate::error::StoreError;
use crate::hash::{content_hash, normalize};

/// A section whose stored value was confirmed after writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub key: ComponentKey,
    pub hash: String,
    pub updated_at: DateTime<Utc>,
    pub write: WriteResult,
}

/// Re-read `key` and compare it with `content`.
pub fn verify_section(
    store: &dyn SectionStore,
    key: ComponentKey,
    content: &str,
) -> Result<ArtifactEntry, StoreError> {
    let expected = normalize(content);
    match store.read_section(key)? {
        None => Err(StoreError::MissingSection { key }),
        Some(entry) if entry.content == expected => Ok(entry),
        Some(entry) => Err(StoreError::VerificationMismatch {
            key,
            expected: content_hash(&expected),
            found: content_hash(&entry.content),
        }),
    }
}

/// One write-and-verify attempt.
pub fn apply_verified(
    store: &dyn SectionStore,
    key: ComponentKey,
    content: &str,
) -> Result<Verified, StoreError> {
    let write = store.write_section(key, content)?;
    let entry = verify_section(store, key, content)?;
    Ok(Verified {
        key,
        hash: entry.hash,
        updated_at: entry.updated_at,
        write,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactStore;
    use tempfile::TempDir;

    /// Writes something other than what it was asked to.
    struct SwappingStore(ArtifactStore);

    impl SectionStore for SwappingStore {
        fn write_section(
            &self,
            key: ComponentKey,
            _content: &str,
        ) -> Result<WriteResult, StoreError> {
            self.0.write_section(key, "not what you asked for")
        }

        fn read_section(&self, key: ComponentKey) -> Result<Option<ArtifactEntry>, StoreError> {
            self.0.read_section(key)
        }
    }

    #[test]
    fn verified_write_reports_stored_hash() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path().join("ctx.json"));
        let verified = apply_verified(&store, ComponentKey::Progress, "# P").unwrap();
        assert_eq!(verified.hash, content_hash("# P"));
        assert!(matches!(verified.write, WriteResult::Written { .. }));
    }

    #[test]
    fn same_content_twice_verifies_both_times() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path().join("ctx.json"));
        let first = apply_verified(&store, ComponentKey::Tasks, "- [ ] one").unwrap();
        let second = apply_verified(&store, ComponentKey::Tasks, "- [ ] one").unwrap();
        assert!(matches!(second.write, WriteResult::Unchanged { .. }));
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[test]
    fn mismatch_is_reported_with_both_hashes() {
        let tmp = TempDir::new().unwrap();
        let store = SwappingStore(ArtifactStore::new(tmp.path().join("ctx.json")));
        let err = apply_verified(&store, ComponentKey::Architecture, "wanted").unwrap_err();
        match err {
            StoreError::VerificationMismatch {
                key,
                expected,
                found,
            } => {
                assert_eq!(key, ComponentKey::Architecture);
                assert_eq!(expected, content_hash("wanted"));
                assert_eq!(found, content_hash("not what you asked for"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_section_fails_verification() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path().join("ctx.json"));
        let err = verify_section(&store, ComponentKey::Tasks, "x").unwrap_err();
        assert!(matches!(err, StoreError::MissingSection { .. }));
    }
}
