//! Sim Worker Binary
//!
//! Runs one worker endpoint with the scripted demo engine until Ctrl-C.

use anyhow::{Context, Result};
use std::process::ExitCode;
use tokio::signal;
use tracing::info;

use sim_relay::config::LoggingConfig;
use sim_relay::execution::worker::WorkerServer;
use sim_relay::logging::init_structured_logging;
use sim_relay::testing::ScriptedEngine;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("sim-worker failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    init_structured_logging(&LoggingConfig::default());

    let bind = std::env::var("SIM_WORKER_BIND").unwrap_or_else(|_| "127.0.0.1:0".to_string());
    let server = WorkerServer::bind(&bind, ScriptedEngine::new())
        .await
        .with_context(|| format!("binding worker to {bind}"))?;
    server.start().await?;

    info!(address = %server.local_addr(), "Worker ready");
    // stdout carries the bound address for whoever started us
    println!("{}", server.local_addr());

    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    server.stop().await;
    Ok(())
}
