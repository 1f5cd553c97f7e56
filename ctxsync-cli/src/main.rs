//! ctxsync: keep an IDE rules artifact in sync with project context docs.
//!
//! # Usage
//!
//! ```text
//! ctxsync init [--root <dir>] [--force]
//! ctxsync run [--config <path>]
//! ctxsync sync [--config <path>]
//! ctxsync push <key> [--file <path>] [--config <path>]
//! ctxsync status [--config <path>] [--json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    init::InitArgs, push::PushArgs, run::RunArgs, status::StatusArgs, sync::SyncArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "ctxsync",
    version,
    about = "Synchronize architecture, progress and task docs into an IDE rules artifact",
    long_about = None,
)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default .ctxsync.yaml.
    Init(InitArgs),

    /// Watch the source docs and keep the artifact in sync until ctrl-c.
    Run(RunArgs),

    /// Sync every source once and exit.
    Sync(SyncArgs),

    /// Replace one artifact section with content from a file or stdin.
    Push(PushArgs),

    /// Compare source docs with the artifact without running the engine.
    Status(StatusArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    ctxsync_engine::init_tracing(cli.json_logs);
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Run(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Push(args) => args.run(),
        Commands::Status(args) => args.run(),
    }
}
