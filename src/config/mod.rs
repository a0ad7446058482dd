//! # Relay Configuration
//!
//! Layered configuration for the job manager, the worker pool, and the
//! driver. Values come from built-in defaults, then optional YAML files in the
//! config directory, then `SIM_RELAY__`-prefixed environment variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sim_relay::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let config = manager.config();
//!
//! println!("dispatching to {} workers", config.workers.count);
//! println!("per-worker timeout {}ms", config.dispatch.worker_timeout_ms);
//! # Ok(())
//! # }
//! ```
//!
//! Environment overrides use double underscores between path segments, e.g.
//! `SIM_RELAY__DISPATCH__WORKER_TIMEOUT_MS=60000` or
//! `SIM_RELAY__WORKERS__ADDRESSES=10.0.0.1:27746,10.0.0.2:27746`.

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use crate::execution::job_manager::JobManagerConfig;
use crate::execution::transport::TcpTransportConfig;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub dispatch: DispatchConfig,
    pub workers: WorkersConfig,
    pub report: ReportConfig,
    pub run: RunConfig,
    pub logging: LoggingConfig,
}

/// Per-request limits applied by the job manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub worker_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_response_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_timeout_ms: 300_000,
            connect_timeout_ms: 5_000,
            max_response_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Number of workers to provision
    pub count: usize,
    /// Host local workers bind to
    pub bind_host: String,
    /// Workers started elsewhere, as `host:port`; when set, nothing is spawned locally
    pub addresses: Option<Vec<String>>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 60,
            bind_host: "127.0.0.1".to_string(),
            addresses: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub name: String,
    pub columns: Vec<String>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            name: "Report".to_string(),
            columns: vec!["BiomassWt".to_string(), "Yield".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Sequential dispatches of the same command
    pub iterations: usize,
    /// Model input handed to the bootstrapper when provisioning
    pub input_file: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            iterations: 1,
            input_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    /// Also write JSON records to a file under `directory`
    pub json_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("log"),
            json_file: false,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.dispatch.worker_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatch.worker_timeout_ms",
                self.dispatch.worker_timeout_ms,
                "must be greater than 0",
            ));
        }
        if self.dispatch.connect_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatch.connect_timeout_ms",
                self.dispatch.connect_timeout_ms,
                "must be greater than 0",
            ));
        }
        if self.dispatch.max_response_bytes == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatch.max_response_bytes",
                self.dispatch.max_response_bytes,
                "must be greater than 0",
            ));
        }
        if self.workers.count == 0 {
            return Err(ConfigurationError::invalid_value(
                "workers.count",
                self.workers.count,
                "at least one worker is required",
            ));
        }
        if let Some(addresses) = &self.workers.addresses {
            if addresses.len() < self.workers.count {
                return Err(ConfigurationError::invalid_value(
                    "workers.addresses",
                    addresses.len(),
                    format!("{} workers requested", self.workers.count),
                ));
            }
            let mut seen = HashSet::with_capacity(addresses.len());
            if let Some(duplicate) = addresses.iter().find(|a| !seen.insert(a.trim())) {
                return Err(ConfigurationError::invalid_value(
                    "workers.addresses",
                    duplicate,
                    "each worker needs its own address",
                ));
            }
        }
        if self.report.name.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "report.name",
                &self.report.name,
                "must not be empty",
            ));
        }
        if self.report.columns.is_empty() {
            return Err(ConfigurationError::invalid_value(
                "report.columns",
                "[]",
                "at least one column is required",
            ));
        }
        if self.run.iterations == 0 {
            return Err(ConfigurationError::invalid_value(
                "run.iterations",
                self.run.iterations,
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn job_manager_config(&self) -> JobManagerConfig {
        JobManagerConfig {
            worker_timeout_ms: self.dispatch.worker_timeout_ms,
        }
    }

    pub fn transport_config(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            connect_timeout_ms: self.dispatch.connect_timeout_ms,
            max_response_bytes: self.dispatch.max_response_bytes,
        }
    }

    /// Resolve the configured static worker addresses, if any
    pub fn worker_addresses(&self) -> ConfigResult<Option<Vec<SocketAddr>>> {
        let Some(addresses) = &self.workers.addresses else {
            return Ok(None);
        };

        addresses
            .iter()
            .map(|address| {
                address
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut resolved| resolved.next())
                    .ok_or_else(|| {
                        ConfigurationError::invalid_value(
                            "workers.addresses",
                            address,
                            "expected host:port",
                        )
                    })
            })
            .collect::<ConfigResult<Vec<_>>>()
            .map(Some)
    }
}
