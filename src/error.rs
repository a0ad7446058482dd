//! Crate-level error type.
//!
//! Each subsystem keeps its own error enum; `RelayError` is what the session
//! layer and the binaries see.

use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::config::ConfigurationError;
use crate::execution::command::CommandError;
use crate::execution::job_manager::DispatchError;
use crate::execution::registry::RegistryError;
use crate::execution::worker::WorkerServerError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Invalid command: {0}")]
    Command(#[from] CommandError),
    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Worker server error: {0}")]
    WorkerServer(#[from] WorkerServerError),
}

impl RelayError {
    /// Index of the worker responsible for this error, when one is known.
    pub fn worker_index(&self) -> Option<usize> {
        match self {
            RelayError::Dispatch(e) => e.worker_index(),
            _ => None,
        }
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::job_manager::WorkerFailure;

    #[test]
    fn test_worker_index_passes_through_dispatch_errors() {
        let error: RelayError = DispatchError::WorkerExecutionFailed {
            index: 7,
            cause: WorkerFailure::Timeout { timeout_ms: 100 },
        }
        .into();

        assert_eq!(error.worker_index(), Some(7));
        assert_eq!(
            error.to_string(),
            "Dispatch failed: Worker 7 failed: timed out after 100ms"
        );

        let error: RelayError = CommandError::NoColumns.into();
        assert_eq!(error.worker_index(), None);
    }
}
