//! # Structured Logging Module
//!
//! Environment-aware structured logging to the console and, optionally, to a
//! JSON file for post-mortem analysis of long dispatch runs.

use chrono::Utc;
use std::fs;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use crate::config::LoggingConfig;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let console = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(env_filter(&log_level));

        let mut log_file = None;
        let json_layer = if config.json_file {
            match fs::create_dir_all(&config.directory) {
                Ok(()) => {
                    let pid = process::id();
                    let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
                    let file_name = format!("{environment}.{pid}.{timestamp}.log");
                    log_file = Some(config.directory.join(&file_name));

                    let appender = tracing_appender::rolling::never(&config.directory, file_name);
                    let (writer, guard) = tracing_appender::non_blocking(appender);
                    // the writer must outlive the process
                    std::mem::forget(guard);

                    Some(
                        fmt::layer()
                            .with_writer(writer)
                            .with_target(true)
                            .with_thread_ids(true)
                            .with_level(true)
                            .with_ansi(false)
                            .json()
                            .with_filter(env_filter(&log_level)),
                    )
                }
                Err(e) => {
                    eprintln!(
                        "Failed to create log directory {}: {e}",
                        config.directory.display()
                    );
                    None
                }
            }
        } else {
            None
        };

        let subscriber = tracing_subscriber::registry().with(console).with(json_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        let log_file = log_file.map(|p| p.display().to_string());
        tracing::info!(
            pid = process::id(),
            environment = %environment,
            log_file = log_file.as_deref(),
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// `RUST_LOG` wins over the environment default
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("SIM_RELAY_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for one dispatch of a command across the pool
pub fn log_dispatch_operation(
    command_id: Uuid,
    workers: usize,
    status: &str,
    elapsed_ms: u64,
    details: Option<&str>,
) {
    tracing::info!(
        command_id = %command_id,
        workers = workers,
        status = %status,
        elapsed_ms = elapsed_ms,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🚀 DISPATCH_OPERATION"
    );
}

/// Log structured data for worker provisioning and teardown
pub fn log_provisioning_operation(
    operation: &str,
    bootstrapper: &str,
    workers: usize,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        bootstrapper = %bootstrapper,
        workers = workers,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🏗️ PROVISIONING_OPERATION"
    );
}
