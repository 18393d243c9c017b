//! Process-level runner: builds the pipeline, serves metrics, and waits for a stop signal.

pub mod metrics_server;

use crate::config::Config;
use crate::registry::build_engine;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Upper bound on waiting for the metrics server after the pipeline stopped.
const METRICS_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config: &Config) -> Result<()> {
    let mut engine = build_engine(config).context("failed to build pipeline")?;
    info!(
        inputs = config.inputs.len(),
        parsers = config.parsers.len(),
        filters = config.filters.len(),
        outputs = config.outputs.len(),
        "lf-agent starting"
    );

    engine.start().context("failed to start pipeline")?;

    let shutdown = CancellationToken::new();
    let metrics_handle = config.agent.metrics_addr.map(|addr| {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { metrics_server::serve(addr, shutdown).await })
    });

    let reason = wait_for_shutdown(engine.cancel_token()).await;
    info!(reason, "shutting down");

    engine.stop().await.context("failed to stop pipeline cleanly")?;
    shutdown.cancel();

    if let Some(handle) = metrics_handle {
        match tokio::time::timeout(METRICS_SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => warn!(error = %format!("{err:#}"), "metrics server failed"),
            Ok(Err(err)) => warn!(error = %err, "metrics server task panicked"),
            Err(_) => warn!("timed out waiting for metrics server to stop"),
        }
    }

    info!("lf-agent stopped");
    Ok(())
}

async fn wait_for_shutdown(engine_token: CancellationToken) -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                return tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                    _ = engine_token.cancelled() => "engine cancelled",
                };
            }
            Err(err) => warn!(error = %err, "failed to install SIGTERM handler"),
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = engine_token.cancelled() => "engine cancelled",
    }
}
