//! `ctxsync sync`: one reconciliation pass over every source.

use anyhow::{bail, Context, Result};
use clap::Args;

use super::{print_outcome, ConfigArgs};

#[derive(Args, Debug)]
pub struct SyncArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let config = self.config.load()?;
        let artifact = config.artifact_path();
        let status = ctxsync_engine::sync_once(config).context("sync failed")?;

        print_outcome(&status);
        if status.has_failures() {
            bail!("one or more sections could not be synced");
        }
        println!("artifact: {}", artifact.display());
        Ok(())
    }
}
