//! `ctxsync run`: foreground engine.

use anyhow::{Context, Result};
use clap::Args;

use super::ConfigArgs;

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let config = self.config.load()?;
        ctxsync_engine::run_blocking(config).context("sync engine exited with error")
    }
}
