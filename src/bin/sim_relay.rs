//! Sim Relay Driver
//!
//! Provisions a worker pool, dispatches the same parameter set to every
//! worker for the configured number of iterations, and prints the rows.

use anyhow::{Context, Result};
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info};

use sim_relay::bootstrap::{Bootstrapper, LocalBootstrapper, RelaySession, StaticBootstrapper};
use sim_relay::config::{ConfigManager, RelayConfig};
use sim_relay::execution::{Command, ParameterBatch, ParameterSet};
use sim_relay::logging::init_structured_logging;
use sim_relay::testing::{ScriptedEngine, TILLER_INTERCEPT};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("sim-relay failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let manager = ConfigManager::load().context("loading configuration")?;
    let config = manager.config();
    init_structured_logging(&config.logging);

    info!(environment = manager.environment(), "Starting sim-relay");

    let mut session = match config.worker_addresses()? {
        Some(addresses) => {
            start_session(
                StaticBootstrapper::new(addresses)
                    .with_transport_config(config.transport_config())
                    .with_job_manager_config(config.job_manager_config()),
            )
            .await?
        }
        None => start_session(LocalBootstrapper::from_config(config, ScriptedEngine::new())).await?,
    };

    let outcome = drive(&mut session, config).await;

    session.shutdown().await.context("tearing down workers")?;
    outcome
}

async fn start_session(bootstrapper: impl Bootstrapper + 'static) -> Result<RelaySession> {
    RelaySession::start(bootstrapper)
        .await
        .context("starting relay session")
}

async fn drive(session: &mut RelaySession, config: &RelayConfig) -> Result<()> {
    let count = config.workers.count;
    session
        .provision(count, config.run.input_file.as_deref())
        .await
        .context("provisioning workers")?;

    let parameters = ParameterSet::new()
        .with(TILLER_INTERCEPT, "0.329")
        .with("[Phenology].TTEndJuvToInit", "160")
        .with("[Leaf].Parameters.aMaxSlope", "22.25");
    let command = Command::new(
        ParameterBatch::repeated(&parameters, count),
        config.report.name.clone(),
        config.report.columns.iter().cloned(),
    )?;

    // dropping the dispatch future releases every outstanding request
    let reports = tokio::select! {
        reports = session.run_iterations(&command, config.run.iterations) => reports?,
        _ = signal::ctrl_c() => anyhow::bail!("interrupted"),
    };

    println!("{}", config.report.columns.join(","));
    for report in &reports {
        for row in report.result.rows() {
            println!("{row}");
        }
    }

    let total: f64 = reports.iter().map(|r| r.elapsed().as_secs_f64()).sum();
    println!(
        "Ran {} iteration(s) across {} workers in {:.3}s",
        reports.len(),
        count,
        total
    );
    for report in &reports {
        println!(
            "  iteration {}: {:.3}s",
            report.iteration + 1,
            report.elapsed().as_secs_f64()
        );
    }

    Ok(())
}
