//! Config loading, error-message and save integration tests.

use std::path::PathBuf;

use assert_fs::prelude::*;
use ctxsync_core::{ComponentKey, ConfigError, SyncConfig, CONFIG_FILE_NAME};
use predicates::prelude::predicate;

// ---------------------------------------------------------------------------
// 1. Load
// ---------------------------------------------------------------------------

#[test]
fn minimal_file_fills_in_defaults() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    dir.child(CONFIG_FILE_NAME)
        .write_str("sources:\n  architecture: docs/arch.md\n  progress: notes/progress.md\n")
        .expect("write");

    let config = SyncConfig::discover(dir.path()).expect("load");
    assert_eq!(config.debounce_ms, 500);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.base_delay_ms, 200);
    assert_eq!(config.poll_interval_ms, 2000);
    assert!(!config.force_polling);

    let bindings = config.bindings();
    assert_eq!(bindings.len(), 2);
    assert_eq!(bindings[0].key, ComponentKey::Architecture);
    assert_eq!(bindings[0].path, dir.path().join("docs/arch.md"));
    assert_eq!(bindings[1].key, ComponentKey::Progress);
    assert_eq!(
        config.artifact_path(),
        dir.path().join(".cursor/rules/context.json")
    );
}

#[test]
fn every_option_is_recognized() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    dir.child(CONFIG_FILE_NAME)
        .write_str(
            "artifact_path: out/rules.json\n\
             debounce_ms: 50\n\
             retry:\n  max_attempts: 5\n  base_delay_ms: 10\n\
             poll_interval_ms: 250\n\
             force_polling: true\n\
             watch_restart_limit: 1\n\
             watch_restart_delay_ms: 20\n\
             sources:\n  tasks: TASKS.md\n",
        )
        .expect("write");

    let config = SyncConfig::discover(dir.path()).expect("load");
    assert_eq!(config.debounce().as_millis(), 50);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.base_delay().as_millis(), 10);
    assert_eq!(config.poll_interval().as_millis(), 250);
    assert!(config.force_polling);
    assert_eq!(config.watch_restart_limit, 1);
    assert_eq!(config.watch_restart_delay().as_millis(), 20);
    assert_eq!(config.artifact_path(), dir.path().join("out/rules.json"));
}

// ---------------------------------------------------------------------------
// 2. Error messages
// ---------------------------------------------------------------------------

#[test]
fn missing_config_returns_not_found() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let err = SyncConfig::discover(dir.path()).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound { .. }), "got: {err}");
    assert!(err.to_string().contains(CONFIG_FILE_NAME));
}

#[test]
fn unknown_option_is_a_parse_error_with_path() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    dir.child(CONFIG_FILE_NAME)
        .write_str("debounce: 10\nsources:\n  tasks: t.md\n")
        .expect("write");

    let err = SyncConfig::discover(dir.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains(CONFIG_FILE_NAME));
}

#[test]
fn unknown_component_key_is_rejected() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    dir.child(CONFIG_FILE_NAME)
        .write_str("sources:\n  roadmap: ROADMAP.md\n")
        .expect("write");

    let err = SyncConfig::discover(dir.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
}

#[test]
fn empty_sources_fail_validation() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    dir.child(CONFIG_FILE_NAME)
        .write_str("sources: {}\n")
        .expect("write");

    let err = SyncConfig::discover(dir.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
}

// ---------------------------------------------------------------------------
// 3. Save
// ---------------------------------------------------------------------------

#[test]
fn saved_default_loads_back_and_leaves_no_tmp() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let path = dir.path().join(CONFIG_FILE_NAME);
    SyncConfig::default_for(dir.path())
        .save_at(&path)
        .expect("save");

    dir.child(CONFIG_FILE_NAME).assert(predicate::path::exists());
    dir.child(".ctxsync.yaml.tmp")
        .assert(predicate::path::missing());

    let loaded = SyncConfig::load_at(&path).expect("load");
    assert_eq!(loaded.sources.len(), 3);
    assert_eq!(
        loaded.sources.get(&ComponentKey::Tasks),
        Some(&PathBuf::from("docs/tasks.md"))
    );
    assert_eq!(loaded.root, dir.path());
}
