//! lf-agent: tails log files and forwards them through a plugin pipeline.

use anyhow::{Context, Result};
use lf_agent::config::{Config, CONFIG_ENV};
use lf_agent::runner;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = Config::resolve_path(std::env::var(CONFIG_ENV).ok(), std::env::args().skip(1));
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;

    runner::run(&config).await
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
