//! Worker Endpoint Registry
//!
//! Holds the provisioned worker addresses and their pool indices. The registry
//! is append-only while workers are being provisioned and is only ever borrowed
//! immutably by dispatch, so the two phases cannot overlap.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use tracing::{debug, info};

/// Address and pool index of one provisioned worker.
///
/// Immutable once assigned. Index `i` receives entry `i` of every parameter
/// batch dispatched against the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerEndpoint {
    index: usize,
    address: SocketAddr,
}

impl WorkerEndpoint {
    pub fn new(index: usize, address: SocketAddr) -> Self {
        Self { index, address }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl fmt::Display for WorkerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker[{}]@{}", self.index, self.address)
    }
}

/// Ordered set of provisioned workers
///
/// # Examples
///
/// ```rust
/// use sim_relay::execution::registry::{WorkerEndpoint, WorkerEndpointRegistry};
///
/// let mut registry = WorkerEndpointRegistry::new();
/// registry
///     .register(vec![
///         WorkerEndpoint::new(0, "10.0.0.1:27746".parse().unwrap()),
///         WorkerEndpoint::new(1, "10.0.0.2:27746".parse().unwrap()),
///     ])
///     .unwrap();
///
/// assert_eq!(registry.count(), 2);
/// assert_eq!(registry.get(1).unwrap().address().to_string(), "10.0.0.2:27746");
/// assert!(registry.get(2).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct WorkerEndpointRegistry {
    endpoints: Vec<WorkerEndpoint>,
}

impl WorkerEndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly provisioned endpoints.
    ///
    /// Indices must continue the existing sequence without gaps and addresses
    /// must be unique across the pool. Nothing is registered if any endpoint is
    /// rejected.
    pub fn register(
        &mut self,
        endpoints: impl IntoIterator<Item = WorkerEndpoint>,
    ) -> Result<(), RegistryError> {
        let endpoints: Vec<WorkerEndpoint> = endpoints.into_iter().collect();

        let mut known: HashSet<SocketAddr> = self.endpoints.iter().map(|e| e.address).collect();
        for (offset, endpoint) in endpoints.iter().enumerate() {
            let expected = self.endpoints.len() + offset;
            if endpoint.index != expected {
                return Err(RegistryError::NonContiguousIndex {
                    expected,
                    found: endpoint.index,
                });
            }
            if !known.insert(endpoint.address) {
                return Err(RegistryError::DuplicateAddress {
                    address: endpoint.address,
                });
            }
        }

        for endpoint in &endpoints {
            debug!(worker_index = endpoint.index, address = %endpoint.address, "Registering worker endpoint");
        }

        let added = endpoints.len();
        self.endpoints.extend(endpoints);
        info!(added, total = self.endpoints.len(), "Worker endpoints registered");

        Ok(())
    }

    /// Register plain addresses, assigning the next free indices in order
    pub fn register_addresses(
        &mut self,
        addresses: impl IntoIterator<Item = SocketAddr>,
    ) -> Result<(), RegistryError> {
        let start = self.next_index();
        let endpoints: Vec<WorkerEndpoint> = addresses
            .into_iter()
            .enumerate()
            .map(|(offset, address)| WorkerEndpoint::new(start + offset, address))
            .collect();
        self.register(endpoints)
    }

    pub fn count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Index the next registered endpoint must carry
    pub fn next_index(&self) -> usize {
        self.endpoints.len()
    }

    pub fn get(&self, index: usize) -> Result<&WorkerEndpoint, RegistryError> {
        self.endpoints
            .get(index)
            .ok_or(RegistryError::IndexOutOfRange {
                index,
                count: self.endpoints.len(),
            })
    }

    /// Endpoints in index order
    pub fn iter(&self) -> impl Iterator<Item = &WorkerEndpoint> {
        self.endpoints.iter()
    }

    /// Remove every endpoint, returning them in index order (used on teardown)
    pub fn clear(&mut self) -> Vec<WorkerEndpoint> {
        let removed = std::mem::take(&mut self.endpoints);
        if !removed.is_empty() {
            info!(removed = removed.len(), "Worker endpoint registry cleared");
        }
        removed
    }
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Worker index {index} out of range (registry holds {count} workers)")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("Worker index {found} breaks the pool sequence, expected {expected}")]
    NonContiguousIndex { expected: usize, found: usize },

    #[error("Worker address {address} is already registered")]
    DuplicateAddress { address: SocketAddr },
}
