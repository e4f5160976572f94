//! `tsched serve` – run the scheduling daemon until interrupted.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use tsched_core::config::ServerConfig;
use tsched_core::events::DirPublisher;
use tsched_core::scheduler::{ThreadRngShuffler, TransfersService};
use tsched_core::storage::SqlStorage;

pub async fn run_serve(storage: SqlStorage, cfg: ServerConfig) -> Result<()> {
    let config = Arc::new(cfg);
    let publisher = Arc::new(DirPublisher::new(&config.messaging_dir)?);
    let service = TransfersService::new(
        Arc::new(storage),
        publisher,
        Arc::clone(&config),
        Arc::new(ThreadRngShuffler),
    );

    let cancel = CancellationToken::new();
    let loop_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { service.run(cancel).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    tracing::info!("shutdown requested, stopping the scheduling loop");
    cancel.cancel();
    loop_handle.await.context("join scheduling loop")?;
    Ok(())
}
