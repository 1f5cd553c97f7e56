//! `ctxsync push <key>`: set one section from a file or stdin.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use ctxsync_core::ComponentKey;
use ctxsync_engine::Health;

use super::{outcome_line, ConfigArgs};

#[derive(Args, Debug)]
pub struct PushArgs {
    /// Component to update: architecture | progress | tasks.
    pub key: ComponentKey,

    /// Read content from this file instead of stdin.
    #[arg(long, short = 'f')]
    pub file: Option<PathBuf>,

    #[command(flatten)]
    pub config: ConfigArgs,
}

impl PushArgs {
    pub fn run(self) -> Result<()> {
        let config = self.config.load()?;
        let content = match &self.file {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("cannot read '{}'", path.display()))?,
            None => {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("cannot read stdin")?;
                buf
            }
        };

        let status = ctxsync_engine::push_once(config, self.key, content)
            .with_context(|| format!("push to '{}' failed", self.key))?;
        let Some(component) = status.component(self.key) else {
            bail!("'{}' has no source binding in this config", self.key);
        };
        println!("{}", outcome_line(component));
        if component.health == Health::Failed {
            bail!("'{}' could not be synced", self.key);
        }
        Ok(())
    }
}
