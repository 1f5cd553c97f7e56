//! Domain types for ctxsync.
//!
//! Paths are `PathBuf` throughout and absolute once a config is resolved.
//! The artifact document is serializable via serde and persisted as JSON by
//! `ctxsync-store`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// On-disk schema version of the artifact document.
pub const ARTIFACT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Component keys
// ---------------------------------------------------------------------------

/// One logical section of the artifact. The set is closed and fixed for the
/// lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKey {
    Architecture,
    Progress,
    Tasks,
}

impl ComponentKey {
    /// Every component key, in artifact order.
    pub fn all() -> &'static [ComponentKey] {
        &[
            ComponentKey::Architecture,
            ComponentKey::Progress,
            ComponentKey::Tasks,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKey::Architecture => "architecture",
            ComponentKey::Progress => "progress",
            ComponentKey::Tasks => "tasks",
        }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "architecture" => Ok(ComponentKey::Architecture),
            "progress" => Ok(ComponentKey::Progress),
            "tasks" => Ok(ComponentKey::Tasks),
            other => Err(ConfigError::UnknownComponent(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// Immutable association between a component key and the source file it is
/// synchronized from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceBinding {
    pub key: ComponentKey,
    /// Absolute path once resolved against the config root.
    pub path: PathBuf,
}

impl SourceBinding {
    pub fn new(key: ComponentKey, path: impl Into<PathBuf>) -> Self {
        Self {
            key,
            path: path.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Artifact document
// ---------------------------------------------------------------------------

/// Last verified value of one component section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub content: String,
    /// Lowercase hex SHA-256 of `content`.
    pub hash: String,
    pub updated_at: DateTime<Utc>,
}

/// The structured document read by IDE tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Artifact {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub components: BTreeMap<ComponentKey, ArtifactEntry>,
}

impl Artifact {
    /// An artifact with no sections.
    pub fn empty() -> Self {
        Self {
            version: ARTIFACT_VERSION,
            updated_at: Utc::now(),
            components: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: ComponentKey) -> Option<&ArtifactEntry> {
        self.components.get(&key)
    }
}

impl Default for Artifact {
    fn default() -> Self {
        Self::empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
