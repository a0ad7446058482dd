//! Configuration Loader
//!
//! Environment-aware loading: defaults, then `sim-relay.yaml`, then
//! `sim-relay.<environment>.yaml`, then `SIM_RELAY__` environment variables.

use config::{Config, Environment, File, FileFormat, Map};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::ConfigResult;
use super::RelayConfig;

const BASE_FILE: &str = "sim-relay.yaml";
const ENV_PREFIX: &str = "SIM_RELAY";

/// Loaded configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: RelayConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_overrides(config_dir, environment, None)
    }

    /// Like [`load_from_directory_with_env`](Self::load_from_directory_with_env),
    /// reading overrides from `overrides` instead of the process environment.
    ///
    /// Keys use the same `SIM_RELAY__SECTION__FIELD` form as real environment
    /// variables.
    pub fn load_with_overrides(
        config_dir: Option<PathBuf>,
        environment: &str,
        overrides: Option<Map<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let config = Self::load_layers(&config_directory, environment, overrides)?;
        config.validate()?;

        info!(
            environment,
            workers = config.workers.count,
            worker_timeout_ms = config.dispatch.worker_timeout_ms,
            static_addresses = config.workers.addresses.is_some(),
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Detect current environment: SIM_RELAY_ENV || APP_ENV || 'development'
    pub fn detect_environment() -> String {
        env::var("SIM_RELAY_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn load_layers(
        config_directory: &Path,
        environment: &str,
        overrides: Option<Map<String, String>>,
    ) -> ConfigResult<RelayConfig> {
        let base_file = config_directory.join(BASE_FILE);
        let env_file = config_directory.join(format!("sim-relay.{environment}.yaml"));

        for file in [&base_file, &env_file] {
            if file.exists() {
                debug!("Found configuration file: {}", file.display());
            }
        }

        let environment_source = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("workers.addresses")
            .with_list_parse_key("report.columns")
            .source(overrides);

        let merged = Config::builder()
            .add_source(Config::try_from(&RelayConfig::default())?)
            .add_source(File::from(base_file).format(FileFormat::Yaml).required(false))
            .add_source(File::from(env_file).format(FileFormat::Yaml).required(false))
            .add_source(environment_source)
            .build()?;

        Ok(merged.try_deserialize()?)
    }
}
