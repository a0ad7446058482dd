#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Sim Relay
//!
//! Command dispatch and result aggregation for a pool of remote simulation
//! workers.
//!
//! ## Overview
//!
//! A job manager sends one parameterised simulation run to each of N workers
//! at once, waits for all of them, and returns their report rows in worker
//! index order. Dispatch is all-or-nothing: one failing, slow, or unreachable
//! worker fails the whole command and cancels the rest.
//!
//! ## Module Organization
//!
//! - [`execution`] - Registry, command model, transport, job manager, aggregator, worker server
//! - [`bootstrap`] - Worker provisioning and the dispatch session
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup
//! - [`error`] - Crate-level error type
//! - [`testing`] - Scripted engine and in-process transport
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sim_relay::bootstrap::{LocalBootstrapper, RelaySession};
//! use sim_relay::execution::{Command, ParameterBatch, ParameterSet};
//! use sim_relay::testing::{ScriptedEngine, TILLER_INTERCEPT};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = RelaySession::start(LocalBootstrapper::new(ScriptedEngine::new())).await?;
//! session.provision(3, None).await?;
//!
//! let batch: ParameterBatch = ["0.1", "0.2", "0.3"]
//!     .iter()
//!     .map(|v| ParameterSet::new().with(TILLER_INTERCEPT, *v))
//!     .collect();
//! let command = Command::new(batch, "Report", ["Yield"])?;
//!
//! let result = session.dispatch(&command).await?;
//! for row in result.rows() {
//!     println!("{row}");
//! }
//!
//! session.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod execution;
pub mod logging;
pub mod testing;

pub use bootstrap::{Bootstrapper, LocalBootstrapper, RelaySession, StaticBootstrapper};
pub use config::{ConfigManager, RelayConfig};
pub use error::{RelayError, RelayResult};
pub use execution::{
    AggregatedResult, Command, DispatchError, JobManager, ParameterBatch, ParameterSet,
    WorkerEndpoint, WorkerEndpointRegistry,
};
