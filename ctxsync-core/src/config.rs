//! `.ctxsync.yaml` configuration.
//!
//! # API pattern
//!
//! - [`SyncConfig::load_at`]: explicit config file path
//! - [`SyncConfig::discover`]: `<dir>/.ctxsync.yaml`
//!
//! Relative paths inside the file resolve against the directory holding it
//! (the config *root*). Resolved accessors (`artifact_path()`, `bindings()`)
//! always return absolute paths.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::types::{ComponentKey, SourceBinding};

/// File name looked up by [`SyncConfig::discover`].
pub const CONFIG_FILE_NAME: &str = ".ctxsync.yaml";

const DEFAULT_ARTIFACT_PATH: &str = ".cursor/rules/context.json";
const DEFAULT_DEBOUNCE_MS: u64 = 500;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 200;
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_WATCH_RESTART_LIMIT: u32 = 3;
const DEFAULT_WATCH_RESTART_DELAY_MS: u64 = 1_000;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Retry budget for one write-and-verify sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Engine configuration as stored in `.ctxsync.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Directory relative paths resolve against. Not serialized.
    #[serde(skip)]
    pub root: PathBuf,
    #[serde(default = "default_artifact_path")]
    pub artifact_path: PathBuf,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub force_polling: bool,
    #[serde(default = "default_watch_restart_limit")]
    pub watch_restart_limit: u32,
    #[serde(default = "default_watch_restart_delay_ms")]
    pub watch_restart_delay_ms: u64,
    pub sources: BTreeMap<ComponentKey, PathBuf>,
}

fn default_artifact_path() -> PathBuf {
    PathBuf::from(DEFAULT_ARTIFACT_PATH)
}
fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_watch_restart_limit() -> u32 {
    DEFAULT_WATCH_RESTART_LIMIT
}
fn default_watch_restart_delay_ms() -> u64 {
    DEFAULT_WATCH_RESTART_DELAY_MS
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl SyncConfig {
    /// Default configuration rooted at `root`, binding every component to
    /// `docs/<key>.md`.
    pub fn default_for(root: impl Into<PathBuf>) -> Self {
        let sources = ComponentKey::all()
            .iter()
            .map(|key| (*key, PathBuf::from("docs").join(format!("{key}.md"))))
            .collect();
        Self {
            root: root.into(),
            artifact_path: default_artifact_path(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            retry: RetrySettings::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            force_polling: false,
            watch_restart_limit: DEFAULT_WATCH_RESTART_LIMIT,
            watch_restart_delay_ms: DEFAULT_WATCH_RESTART_DELAY_MS,
            sources,
        }
    }

    /// Load and validate the config file at `path`.
    ///
    /// Returns `ConfigError::NotFound` if absent,
    /// `ConfigError::Parse` (with path + line context) if malformed YAML.
    pub fn load_at(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let mut config: SyncConfig =
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?;
        config.root = absolute_parent(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `<dir>/.ctxsync.yaml`.
    pub fn discover(dir: &Path) -> Result<Self, ConfigError> {
        Self::load_at(&dir.join(CONFIG_FILE_NAME))
    }

    /// Save to `path` atomically (`<path>.tmp` then rename).
    pub fn save_at(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        let yaml = serde_yaml::to_string(self)?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(path, e));
        }
        Ok(())
    }

    /// Check every constraint the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one source binding is required".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        let artifact = self.artifact_path();
        let mut seen = HashSet::new();
        for binding in self.bindings() {
            if binding.path == artifact {
                return Err(ConfigError::Invalid(format!(
                    "source for '{}' is the artifact itself: {}",
                    binding.key,
                    artifact.display()
                )));
            }
            if !seen.insert(binding.path.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "source path bound twice: {}",
                    binding.path.display()
                )));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Resolved accessors
    // -----------------------------------------------------------------------

    pub fn artifact_path(&self) -> PathBuf {
        self.resolve(&self.artifact_path)
    }

    /// Source bindings in component key order, with absolute paths.
    pub fn bindings(&self) -> Vec<SourceBinding> {
        self.sources
            .iter()
            .map(|(key, path)| SourceBinding::new(*key, self.resolve(path)))
            .collect()
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn watch_restart_delay(&self) -> Duration {
        Duration::from_millis(self.watch_restart_delay_ms)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

fn absolute_parent(config_path: &Path) -> Result<PathBuf, ConfigError> {
    let parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if parent.is_absolute() {
        return Ok(parent.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| io_err(parent, e))?;
    Ok(cwd.join(parent))
}
