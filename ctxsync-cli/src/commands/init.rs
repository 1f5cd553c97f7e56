//! `ctxsync init [--root <dir>] [--force]`

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use ctxsync_core::{SyncConfig, CONFIG_FILE_NAME};

/// Write a default config binding every component to `docs/<key>.md`.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Project root the config and relative paths belong to.
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Overwrite an existing config.
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let root = self
            .root
            .canonicalize()
            .with_context(|| format!("cannot resolve root '{}'", self.root.display()))?;
        let path = root.join(CONFIG_FILE_NAME);
        if path.exists() && !self.force {
            bail!(
                "{} already exists; pass --force to overwrite",
                path.display()
            );
        }

        let config = SyncConfig::default_for(&root);
        config
            .save_at(&path)
            .with_context(|| format!("failed to write '{}'", path.display()))?;

        // The watcher needs every source directory to exist.
        for binding in config.bindings() {
            if let Some(dir) = binding.path.parent() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("cannot create '{}'", dir.display()))?;
            }
        }

        println!("✓ Wrote {}", path.display());
        for binding in config.bindings() {
            println!("  {:<12} ← {}", binding.key.to_string(), binding.path.display());
        }
        println!("  artifact     → {}", config.artifact_path().display());
        Ok(())
    }
}
