//! Worker provisioning and the dispatch session built on top of it.
//!
//! A [`Bootstrapper`] owns the compute units: it creates them, tears them
//! down, and builds the [`JobManager`] that talks to them. [`RelaySession`]
//! ties a bootstrapper to the [`WorkerEndpointRegistry`]. Provisioning needs
//! `&mut RelaySession` while dispatch only borrows it, so the two phases can
//! never overlap.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::execution::aggregator::AggregatedResult;
use crate::execution::command::Command;
use crate::execution::job_manager::{DispatchError, JobManager, JobManagerConfig};
use crate::execution::registry::{RegistryError, WorkerEndpoint, WorkerEndpointRegistry};
use crate::execution::transport::TcpTransportConfig;
use crate::execution::worker::{SimulationEngine, WorkerServer, WorkerServerError};
use crate::logging::log_provisioning_operation;

/// Creates and releases worker compute units
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// One-time setup before anything is provisioned
    async fn initialise(&mut self) -> Result<(), BootstrapError> {
        Ok(())
    }

    /// Release anything left over from a previous run
    async fn cleanup_workers(&mut self) -> Result<(), BootstrapError>;

    /// Create `count` workers, returned in the order they should be indexed.
    ///
    /// Indices continue after any workers this bootstrapper already provisioned.
    async fn provision_workers(
        &mut self,
        count: usize,
        input_spec: Option<&Path>,
    ) -> Result<Vec<WorkerEndpoint>, BootstrapError>;

    /// Give back endpoints from the latest `provision_workers` call that
    /// never made it into a registry
    async fn release_workers(&mut self, endpoints: &[WorkerEndpoint]) -> Result<(), BootstrapError>;

    fn create_job_manager(&self) -> JobManager;

    async fn teardown_workers(&mut self) -> Result<(), BootstrapError>;
}

/// Provisioning errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    #[error("Requested {requested} workers but only {available} addresses are available")]
    InsufficientAddresses { requested: usize, available: usize },

    #[error("Input spec {path} is not readable: {error}")]
    InputSpec { path: PathBuf, error: String },

    #[error("Failed to start worker: {0}")]
    WorkerStart(#[from] WorkerServerError),

    #[error("Provisioned workers were rejected: {0}")]
    Registry(#[from] RegistryError),
}

async fn check_input_spec(input_spec: Option<&Path>) -> Result<(), BootstrapError> {
    if let Some(path) = input_spec {
        tokio::fs::metadata(path)
            .await
            .map_err(|e| BootstrapError::InputSpec {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;
    }
    Ok(())
}

/// Runs workers as in-process [`WorkerServer`]s on OS-assigned ports
pub struct LocalBootstrapper {
    engine: Arc<dyn SimulationEngine>,
    bind_host: String,
    transport_config: TcpTransportConfig,
    job_manager_config: JobManagerConfig,
    servers: Vec<WorkerServer>,
}

impl LocalBootstrapper {
    pub fn new(engine: impl SimulationEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            bind_host: "127.0.0.1".to_string(),
            transport_config: TcpTransportConfig::default(),
            job_manager_config: JobManagerConfig::default(),
            servers: Vec::new(),
        }
    }

    pub fn from_config(config: &RelayConfig, engine: impl SimulationEngine) -> Self {
        Self::new(engine)
            .with_bind_host(config.workers.bind_host.clone())
            .with_transport_config(config.transport_config())
            .with_job_manager_config(config.job_manager_config())
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_transport_config(mut self, config: TcpTransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    pub fn with_job_manager_config(mut self, config: JobManagerConfig) -> Self {
        self.job_manager_config = config;
        self
    }

    /// Running servers in index order
    pub fn servers(&self) -> &[WorkerServer] {
        &self.servers
    }

    async fn stop_all(&mut self) {
        for server in self.servers.drain(..) {
            server.stop().await;
        }
    }
}

async fn start_worker(
    address: &str,
    engine: &Arc<dyn SimulationEngine>,
) -> Result<WorkerServer, WorkerServerError> {
    let server = WorkerServer::bind_shared(address, Arc::clone(engine)).await?;
    server.start().await?;
    Ok(server)
}

#[async_trait]
impl Bootstrapper for LocalBootstrapper {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn cleanup_workers(&mut self) -> Result<(), BootstrapError> {
        self.stop_all().await;
        Ok(())
    }

    async fn provision_workers(
        &mut self,
        count: usize,
        input_spec: Option<&Path>,
    ) -> Result<Vec<WorkerEndpoint>, BootstrapError> {
        check_input_spec(input_spec).await?;

        let address = format!("{}:0", self.bind_host);
        let mut started = Vec::with_capacity(count);
        for _ in 0..count {
            match start_worker(&address, &self.engine).await {
                Ok(server) => started.push(server),
                Err(e) => {
                    for server in &started {
                        server.stop().await;
                    }
                    return Err(e.into());
                }
            }
        }

        let first_index = self.servers.len();
        let endpoints = started
            .iter()
            .enumerate()
            .map(|(offset, server)| WorkerEndpoint::new(first_index + offset, server.local_addr()))
            .collect();
        self.servers.extend(started);

        Ok(endpoints)
    }

    async fn release_workers(&mut self, endpoints: &[WorkerEndpoint]) -> Result<(), BootstrapError> {
        let (released, kept): (Vec<_>, Vec<_>) = self.servers.drain(..).partition(|server| {
            endpoints
                .iter()
                .any(|endpoint| endpoint.address() == server.local_addr())
        });
        self.servers = kept;
        for server in released {
            server.stop().await;
        }
        Ok(())
    }

    fn create_job_manager(&self) -> JobManager {
        JobManager::tcp(self.transport_config.clone(), self.job_manager_config.clone())
    }

    async fn teardown_workers(&mut self) -> Result<(), BootstrapError> {
        self.stop_all().await;
        Ok(())
    }
}

/// Hands out workers that were started elsewhere
#[derive(Debug, Clone)]
pub struct StaticBootstrapper {
    addresses: Vec<SocketAddr>,
    provisioned: usize,
    transport_config: TcpTransportConfig,
    job_manager_config: JobManagerConfig,
}

impl StaticBootstrapper {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self {
            addresses,
            provisioned: 0,
            transport_config: TcpTransportConfig::default(),
            job_manager_config: JobManagerConfig::default(),
        }
    }

    pub fn with_transport_config(mut self, config: TcpTransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    pub fn with_job_manager_config(mut self, config: JobManagerConfig) -> Self {
        self.job_manager_config = config;
        self
    }
}

#[async_trait]
impl Bootstrapper for StaticBootstrapper {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn cleanup_workers(&mut self) -> Result<(), BootstrapError> {
        self.provisioned = 0;
        Ok(())
    }

    async fn provision_workers(
        &mut self,
        count: usize,
        input_spec: Option<&Path>,
    ) -> Result<Vec<WorkerEndpoint>, BootstrapError> {
        let available = self.addresses.len() - self.provisioned;
        if count > available {
            return Err(BootstrapError::InsufficientAddresses {
                requested: count,
                available,
            });
        }
        if let Some(path) = input_spec {
            // remote workers load their own input
            debug!(input = %path.display(), "Ignoring input spec for static workers");
        }

        let first_index = self.provisioned;
        let endpoints = self.addresses[first_index..first_index + count]
            .iter()
            .enumerate()
            .map(|(offset, address)| WorkerEndpoint::new(first_index + offset, *address))
            .collect();
        self.provisioned += count;

        Ok(endpoints)
    }

    async fn release_workers(&mut self, endpoints: &[WorkerEndpoint]) -> Result<(), BootstrapError> {
        if let Some(first) = endpoints.iter().map(WorkerEndpoint::index).min() {
            self.provisioned = self.provisioned.min(first);
        }
        Ok(())
    }

    fn create_job_manager(&self) -> JobManager {
        JobManager::tcp(self.transport_config.clone(), self.job_manager_config.clone())
    }

    async fn teardown_workers(&mut self) -> Result<(), BootstrapError> {
        self.provisioned = 0;
        Ok(())
    }
}

/// Outcome of one dispatch in a repeated run
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: usize,
    pub result: AggregatedResult,
}

impl IterationReport {
    pub fn elapsed(&self) -> Duration {
        self.result.elapsed()
    }
}

/// A provisioned worker pool plus the job manager bound to it
///
/// # Examples
///
/// ```rust,no_run
/// use sim_relay::bootstrap::{LocalBootstrapper, RelaySession};
/// use sim_relay::execution::command::{Command, ParameterBatch, ParameterSet};
/// use sim_relay::testing::ScriptedEngine;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut session = RelaySession::start(LocalBootstrapper::new(ScriptedEngine::new())).await?;
/// session.provision(4, None).await?;
///
/// let set = ParameterSet::new().with("[Phenology].TTEndJuvToInit", "160");
/// let command = Command::new(ParameterBatch::repeated(&set, 4), "Report", ["Yield"])?;
/// let result = session.dispatch(&command).await?;
/// assert_eq!(result.len(), 4);
///
/// session.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct RelaySession {
    bootstrapper: Box<dyn Bootstrapper>,
    registry: WorkerEndpointRegistry,
    job_manager: JobManager,
}

impl RelaySession {
    /// Initialise the bootstrapper and clear any stale workers
    pub async fn start(bootstrapper: impl Bootstrapper + 'static) -> Result<Self, BootstrapError> {
        let mut bootstrapper: Box<dyn Bootstrapper> = Box::new(bootstrapper);
        bootstrapper.initialise().await?;
        bootstrapper.cleanup_workers().await?;
        let job_manager = bootstrapper.create_job_manager();

        info!(bootstrapper = bootstrapper.name(), "Relay session started");

        Ok(Self {
            bootstrapper,
            registry: WorkerEndpointRegistry::new(),
            job_manager,
        })
    }

    /// Provision `count` more workers and add them to the registry
    pub async fn provision(
        &mut self,
        count: usize,
        input_spec: Option<&Path>,
    ) -> Result<&WorkerEndpointRegistry, BootstrapError> {
        let name = self.bootstrapper.name();
        let endpoints = match self.bootstrapper.provision_workers(count, input_spec).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                log_provisioning_operation("provision", name, count, "failed", Some(&e.to_string()));
                return Err(e);
            }
        };

        if let Err(e) = self.registry.register(endpoints.clone()) {
            log_provisioning_operation("provision", name, count, "rejected", Some(&e.to_string()));
            self.bootstrapper.release_workers(&endpoints).await?;
            return Err(e.into());
        }
        log_provisioning_operation("provision", name, self.registry.count(), "completed", None);

        Ok(&self.registry)
    }

    pub fn registry(&self) -> &WorkerEndpointRegistry {
        &self.registry
    }

    pub fn job_manager(&self) -> &JobManager {
        &self.job_manager
    }

    pub async fn dispatch(&self, command: &Command) -> Result<AggregatedResult, DispatchError> {
        self.job_manager.dispatch(command, &self.registry).await
    }

    pub async fn dispatch_with_cancellation(
        &self,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<AggregatedResult, DispatchError> {
        self.job_manager
            .dispatch_with_cancellation(command, &self.registry, cancel)
            .await
    }

    /// Dispatch `command` `iterations` times in sequence, each under a fresh
    /// command ID. Stops at the first failed iteration.
    pub async fn run_iterations(
        &self,
        command: &Command,
        iterations: usize,
    ) -> Result<Vec<IterationReport>, DispatchError> {
        let mut reports = Vec::with_capacity(iterations);
        for iteration in 0..iterations {
            let command = if iteration == 0 {
                command.clone()
            } else {
                command.reissue()
            };

            let result = self.dispatch(&command).await.inspect_err(|e| {
                warn!(iteration, error = %e, "Iteration failed");
            })?;
            info!(
                iteration,
                elapsed_ms = result.elapsed().as_millis() as u64,
                "Iteration completed"
            );
            reports.push(IterationReport { iteration, result });
        }
        Ok(reports)
    }

    /// Release every worker; the session can provision again afterwards
    pub async fn teardown(&mut self) -> Result<(), BootstrapError> {
        let name = self.bootstrapper.name();
        let released = self.registry.clear();
        self.bootstrapper.teardown_workers().await?;
        log_provisioning_operation("teardown", name, released.len(), "completed", None);
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<(), BootstrapError> {
        self.teardown().await
    }
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("bootstrapper", &self.bootstrapper.name())
            .field("registry", &self.registry)
            .field("job_manager", &self.job_manager)
            .finish()
    }
}
