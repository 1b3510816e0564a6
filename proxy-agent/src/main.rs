//! Proxy Agent Binary Entry Point

use clap::Parser;
use proxy_agent::{load_config, logging::init_logging, Agent, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive so the file writer flushes on exit
    let _log_guard = init_logging(&args.logging_config())?;

    let config = load_config(&args)?;
    let agent = Agent::start(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping agent...");
    agent.shutdown().await;

    Ok(())
}
