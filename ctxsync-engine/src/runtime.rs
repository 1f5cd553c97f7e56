//! Foreground and one-shot drivers around [`SyncEngine`].

use tokio::runtime::Runtime;

use ctxsync_core::{ComponentKey, SyncConfig};

use crate::engine::SyncEngine;
use crate::error::{io_err, EngineError};
use crate::status::EngineStatus;

/// Install the global `tracing` subscriber on stderr. `RUST_LOG` overrides
/// the default `info` filter. Safe to call more than once.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        let _ = fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    } else {
        let _ = fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }
}

fn build_runtime() -> Result<Runtime, EngineError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))
}

/// Run the engine and block the current thread until it stops.
pub fn run_blocking(config: SyncConfig) -> Result<(), EngineError> {
    build_runtime()?.block_on(run(config))
}

/// Run the engine until ctrl-c or until it stops itself after an
/// unrecoverable watch failure.
pub async fn run(config: SyncConfig) -> Result<(), EngineError> {
    let engine = SyncEngine::new(config);
    engine.start().await?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => tracing::info!("received ctrl-c, stopping engine"),
            Err(err) => tracing::warn!(error = %err, "ctrl-c handler failed, stopping engine"),
        },
        _ = engine.closed() => tracing::warn!("engine stopped itself"),
    }

    engine.stop().await
}

/// Start, reconcile every source, wait until idle and stop.
pub fn sync_once(config: SyncConfig) -> Result<EngineStatus, EngineError> {
    build_runtime()?.block_on(async move {
        let engine = SyncEngine::new(config);
        engine.start().await?;
        engine.wait_idle().await;
        let status = engine.status().await;
        engine.stop().await?;
        Ok(status)
    })
}

/// Like [`sync_once`], then apply `content` to `key`. The pushed content is
/// applied after the key's source file, so it is what the artifact holds
/// afterwards.
pub fn push_once(
    config: SyncConfig,
    key: ComponentKey,
    content: String,
) -> Result<EngineStatus, EngineError> {
    build_runtime()?.block_on(async move {
        let engine = SyncEngine::new(config);
        engine.start().await?;
        engine.wait_idle().await;
        let pushed = engine.queue_update(key, content);
        engine.wait_idle().await;
        let status = engine.status().await;
        engine.stop().await?;
        pushed?;
        Ok(status)
    })
}
