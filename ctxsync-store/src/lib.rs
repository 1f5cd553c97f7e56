//! # ctxsync-store
//!
//! Artifact persistence: hash-gated atomic writer, post-write verifier and
//! the bounded retry controller that drives them.
//!
//! The engine talks to the artifact through the [`SectionStore`] trait;
//! [`ArtifactStore`] is the on-disk implementation. One write-and-verify
//! attempt is [`apply_verified`], and [`RetryPolicy::run`] wraps attempts
//! with progressively delayed retries.

pub mod artifact;
pub mod error;
pub mod hash;
pub mod retry;
pub mod verify;

pub use artifact::{ArtifactStore, PrimeOutcome, SectionStore, WriteResult};
pub use error::{RetryError, StoreError};
pub use hash::{content_hash, normalize};
pub use retry::{Retried, RetryContext, RetryPolicy, ThreadSleep};
pub use verify::{apply_verified, verify_section, Verified};
