pub mod init;
pub mod push;
pub mod run;
pub mod status;
pub mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use ctxsync_core::{SyncConfig, CONFIG_FILE_NAME};
use ctxsync_engine::{ComponentStatus, EngineStatus, Health};

/// `--config` shared by every command that needs a loaded configuration.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Path to the config file. Defaults to ./.ctxsync.yaml.
    #[arg(long, short = 'c', value_name = "PATH")]
    pub config: Option<PathBuf>,
}

impl ConfigArgs {
    pub fn load(&self) -> Result<SyncConfig> {
        match &self.config {
            Some(path) => SyncConfig::load_at(path)
                .with_context(|| format!("failed to load config '{}'", path.display())),
            None => {
                let cwd = std::env::current_dir().context("cannot determine working directory")?;
                SyncConfig::discover(&cwd).with_context(|| {
                    format!("no usable {CONFIG_FILE_NAME} here; run `ctxsync init` first")
                })
            }
        }
    }
}

/// One line per component after a one-shot run.
pub fn print_outcome(status: &EngineStatus) {
    for component in &status.components {
        println!("{}", outcome_line(component));
    }
}

pub fn outcome_line(component: &ComponentStatus) -> String {
    let retries = match component.retries() {
        0 => String::new(),
        n => format!(" after {n} retries"),
    };
    match component.health {
        Health::Synced => {
            let verb = match &component.last_applied {
                Some(applied) if applied.written => "written",
                _ => "unchanged",
            };
            format!("✓ {} {verb}{retries}", component.key)
        }
        Health::Failed => format!(
            "✗ {} failed{retries}: {}",
            component.key,
            component.last_error.as_deref().unwrap_or("unknown error")
        ),
        Health::Idle if !component.source_present => {
            format!("· {} skipped (no source file)", component.key)
        }
        Health::Idle => format!("· {} idle", component.key),
    }
}
