//! Job Manager
//!
//! Fans a [`Command`] out across every registered worker concurrently, waits
//! for all of them, and fans the reports back in through the
//! [`ResultAggregator`].
//!
//! Dispatch is all-or-nothing: the first worker failure (transport error,
//! simulation error, timeout, or a panicked request task) cancels every
//! outstanding request and the caller gets only the error. Output order is
//! governed by worker index, never by completion time.

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::execution::aggregator::{AggregatedResult, AggregationError, ResultAggregator};
use crate::execution::command::Command;
use crate::execution::message_protocols::{WorkerOutcome, WorkerRequest, PROTOCOL_VERSION};
use crate::execution::registry::{WorkerEndpoint, WorkerEndpointRegistry};
use crate::execution::transport::{
    TcpTransport, TcpTransportConfig, TransportError, WorkerTransport,
};
use crate::logging::log_dispatch_operation;

/// Job manager configuration
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    /// Independent timeout applied to every per-worker request
    pub worker_timeout_ms: u64,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            worker_timeout_ms: 300_000, // 5 minutes
        }
    }
}

/// Coordinator that dispatches commands to the worker pool
///
/// # Examples
///
/// ```rust,no_run
/// use sim_relay::execution::command::{Command, ParameterBatch, ParameterSet};
/// use sim_relay::execution::job_manager::{JobManager, JobManagerConfig};
/// use sim_relay::execution::registry::WorkerEndpointRegistry;
/// use sim_relay::execution::transport::TcpTransportConfig;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut registry = WorkerEndpointRegistry::new();
/// registry.register_addresses(vec!["10.0.0.1:27746".parse()?, "10.0.0.2:27746".parse()?])?;
///
/// let batch: ParameterBatch = ["0.1", "0.2"]
///     .iter()
///     .map(|v| ParameterSet::new().with("[Leaf].Parameters.tillerSdIntercept", *v))
///     .collect();
/// let command = Command::new(batch, "Report", ["Yield"])?;
///
/// let manager = JobManager::tcp(TcpTransportConfig::default(), JobManagerConfig::default());
/// let result = manager.dispatch(&command, &registry).await?;
/// for row in result.rows() {
///     println!("{row}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct JobManager {
    transport: Arc<dyn WorkerTransport>,
    config: JobManagerConfig,
}

impl JobManager {
    pub fn new(transport: Arc<dyn WorkerTransport>, config: JobManagerConfig) -> Self {
        Self { transport, config }
    }

    /// Job manager speaking newline-delimited JSON over TCP
    pub fn tcp(transport_config: TcpTransportConfig, config: JobManagerConfig) -> Self {
        Self::new(Arc::new(TcpTransport::new(transport_config)), config)
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.config
    }

    /// Dispatch `command` across every worker in `registry` and wait for all
    /// results.
    pub async fn dispatch(
        &self,
        command: &Command,
        registry: &WorkerEndpointRegistry,
    ) -> Result<AggregatedResult, DispatchError> {
        self.dispatch_with_cancellation(command, registry, &CancellationToken::new())
            .await
    }

    /// Like [`dispatch`](Self::dispatch), but abandons the whole batch as soon
    /// as `cancel` fires.
    ///
    /// Cancellation reaches every outstanding request; the registry is left
    /// untouched. Dropping the returned future has the same effect.
    #[instrument(
        name = "dispatch",
        skip_all,
        fields(command_id = %command.command_id(), workers = registry.count())
    )]
    pub async fn dispatch_with_cancellation(
        &self,
        command: &Command,
        registry: &WorkerEndpointRegistry,
        cancel: &CancellationToken,
    ) -> Result<AggregatedResult, DispatchError> {
        let worker_count = registry.count();
        let batch_len = command.batch().len();

        if batch_len != worker_count {
            warn!(batch_len, worker_count, "Parameter batch does not match worker pool");
            return Err(DispatchError::SizeMismatch {
                batch_len,
                worker_count,
            });
        }

        let started = Instant::now();
        let worker_timeout = Duration::from_millis(self.config.worker_timeout_ms);
        let dispatch_token = cancel.child_token();
        let mut in_flight_guard = InFlightGuard::new(dispatch_token.clone());
        let mut in_flight = FuturesUnordered::new();

        info!(
            report = command.report_name(),
            columns = ?command.columns(),
            "Dispatching command to {} workers",
            worker_count
        );

        for endpoint in registry.iter() {
            let index = endpoint.index();
            let request = command
                .request_for(index)
                .ok_or(DispatchError::SizeMismatch {
                    batch_len,
                    worker_count,
                })?;

            let handle = tokio::spawn(execute_on_worker(
                Arc::clone(&self.transport),
                endpoint.clone(),
                request,
                worker_timeout,
                dispatch_token.clone(),
            ));
            in_flight_guard.track(handle.abort_handle());
            in_flight.push(async move { (index, handle.await) });
        }

        let mut payloads: Vec<Option<Value>> = vec![None; worker_count];
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Dispatch cancelled, abandoning outstanding worker requests");
                    return Err(DispatchError::Cancelled);
                }
                next = in_flight.next() => next,
            };

            let Some((index, joined)) = next else {
                break;
            };

            let failure = match joined {
                Ok(Ok(payload)) => {
                    payloads[index] = Some(payload);
                    continue;
                }
                Ok(Err(AttemptError::Cancelled)) => return Err(DispatchError::Cancelled),
                Ok(Err(AttemptError::Failed(cause))) => cause,
                Err(join_error) => WorkerFailure::Panicked(join_error.to_string()),
            };

            error!(worker_index = index, cause = %failure, "Worker failed, aborting dispatch");
            log_dispatch_operation(
                command.command_id(),
                worker_count,
                "failed",
                started.elapsed().as_millis() as u64,
                Some(&failure.to_string()),
            );
            return Err(DispatchError::WorkerExecutionFailed {
                index,
                cause: failure,
            });
        }

        let payloads = payloads
            .into_iter()
            .enumerate()
            .map(|(worker_index, payload)| {
                payload.ok_or_else(|| DispatchError::MalformedPayload {
                    worker_index,
                    reason: "no response recorded".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let elapsed = started.elapsed();
        let result = ResultAggregator::new(command.columns())
            .aggregate(command.command_id(), payloads, elapsed)
            .inspect_err(|e| error!(error = %e, "Failed to aggregate worker results"))?;

        info!(
            rows = result.rows().count(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Dispatch completed"
        );
        log_dispatch_operation(
            command.command_id(),
            worker_count,
            "completed",
            elapsed.as_millis() as u64,
            None,
        );

        Ok(result)
    }
}

/// Cancels and aborts every tracked request task when dropped, so an early
/// return or a dropped dispatch future never leaves requests running.
struct InFlightGuard {
    token: CancellationToken,
    handles: Vec<AbortHandle>,
}

impl InFlightGuard {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            handles: Vec::new(),
        }
    }

    fn track(&mut self, handle: AbortHandle) {
        self.handles.push(handle);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.token.cancel();
        for handle in &self.handles {
            handle.abort();
        }
    }
}

enum AttemptError {
    Cancelled,
    Failed(WorkerFailure),
}

/// Run one request against one worker under its own timeout
async fn execute_on_worker(
    transport: Arc<dyn WorkerTransport>,
    endpoint: WorkerEndpoint,
    request: WorkerRequest,
    worker_timeout: Duration,
    cancel: CancellationToken,
) -> Result<Value, AttemptError> {
    let started = Instant::now();
    debug!(worker_index = endpoint.index(), address = %endpoint.address(), "Sending request");

    let attempt = tokio::time::timeout(worker_timeout, transport.execute(&endpoint, &request));
    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(worker_index = endpoint.index(), "Request cancelled");
            return Err(AttemptError::Cancelled);
        }
        outcome = attempt => outcome,
    };

    let response = match outcome {
        Err(_) => {
            warn!(
                worker_index = endpoint.index(),
                timeout_ms = worker_timeout.as_millis() as u64,
                "Worker request timed out"
            );
            return Err(AttemptError::Failed(WorkerFailure::Timeout {
                timeout_ms: worker_timeout.as_millis() as u64,
            }));
        }
        Ok(Err(e)) => return Err(AttemptError::Failed(WorkerFailure::Transport(e))),
        Ok(Ok(response)) => response,
    };

    if response.protocol_version != PROTOCOL_VERSION {
        return Err(AttemptError::Failed(WorkerFailure::Protocol(format!(
            "worker speaks protocol {:?}, expected {PROTOCOL_VERSION}",
            response.protocol_version
        ))));
    }
    if response.worker_index != endpoint.index() {
        return Err(AttemptError::Failed(WorkerFailure::Protocol(format!(
            "response claims worker index {}",
            response.worker_index
        ))));
    }

    match response.outcome {
        WorkerOutcome::Completed { table } => {
            debug!(
                worker_index = endpoint.index(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                worker_time_ms = response.execution_time_ms,
                "Worker completed"
            );
            Ok(table)
        }
        WorkerOutcome::Failed { message } => {
            Err(AttemptError::Failed(WorkerFailure::Simulation(message)))
        }
    }
}

/// Why a single worker's request failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerFailure {
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("simulation error: {0}")]
    Simulation(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("request task panicked: {0}")]
    Panicked(String),
}

/// Dispatch errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Parameter batch has {batch_len} entries but {worker_count} workers are registered")]
    SizeMismatch {
        batch_len: usize,
        worker_count: usize,
    },

    #[error("Worker {index} failed: {cause}")]
    WorkerExecutionFailed {
        index: usize,
        #[source]
        cause: WorkerFailure,
    },

    #[error("Worker {worker_index} report is missing requested column '{name}'")]
    ColumnMissing { name: String, worker_index: usize },

    #[error("Worker {worker_index} returned a malformed payload: {reason}")]
    MalformedPayload { worker_index: usize, reason: String },

    #[error("Dispatch cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Index of the worker the error is attributed to
    pub fn worker_index(&self) -> Option<usize> {
        match self {
            DispatchError::WorkerExecutionFailed { index, .. } => Some(*index),
            DispatchError::ColumnMissing { worker_index, .. }
            | DispatchError::MalformedPayload { worker_index, .. } => Some(*worker_index),
            DispatchError::SizeMismatch { .. } | DispatchError::Cancelled => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DispatchError::WorkerExecutionFailed {
                cause: WorkerFailure::Timeout { .. },
                ..
            }
        )
    }
}

impl From<AggregationError> for DispatchError {
    fn from(error: AggregationError) -> Self {
        match error {
            AggregationError::ColumnMissing { name, worker_index } => {
                DispatchError::ColumnMissing { name, worker_index }
            }
            AggregationError::MalformedPayload {
                worker_index,
                reason,
            } => DispatchError::MalformedPayload {
                worker_index,
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::command::{ParameterBatch, ParameterSet};
    use crate::testing::{MockTransport, ScriptedEngine, TILLER_INTERCEPT};
    use std::net::SocketAddr;

    fn registry(count: usize) -> WorkerEndpointRegistry {
        let mut registry = WorkerEndpointRegistry::new();
        registry
            .register_addresses((0..count).map(|i| SocketAddr::from(([127, 0, 0, 1], 9000 + i as u16))))
            .unwrap();
        registry
    }

    fn tiller_command(values: &[&str], columns: &[&str]) -> Command {
        let batch: ParameterBatch = values
            .iter()
            .map(|v| ParameterSet::new().with(TILLER_INTERCEPT, *v))
            .collect();
        Command::new(batch, "Report", columns.iter().copied()).unwrap()
    }

    fn manager(transport: Arc<MockTransport>, timeout_ms: u64) -> JobManager {
        JobManager::new(
            transport,
            JobManagerConfig {
                worker_timeout_ms: timeout_ms,
            },
        )
    }

    #[tokio::test]
    async fn test_results_follow_worker_index_not_completion_order() {
        // worker 0 is slowest, worker 2 fastest
        let transport = Arc::new(
            MockTransport::new(ScriptedEngine::new())
                .delay_on(0, Duration::from_millis(60))
                .delay_on(1, Duration::from_millis(30)),
        );
        let command = tiller_command(&["0.1", "0.2", "0.3"], &["Yield"]);

        let result = manager(transport.clone(), 5_000)
            .dispatch(&command, &registry(3))
            .await
            .unwrap();

        assert_eq!(result.len(), 3);
        for (i, expected) in ["0.1", "0.2", "0.3"].iter().enumerate() {
            let row = result.get(i).unwrap().first_row().unwrap();
            assert_eq!(row.len(), 1);
            assert_eq!(row.get(0), Some(ScriptedEngine::expected_yield(expected).as_str()));
        }
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test]
    async fn test_each_worker_receives_its_own_parameter_set() {
        let transport = Arc::new(MockTransport::new(ScriptedEngine::new()));
        let command = tiller_command(&["0.1", "0.2", "0.3"], &["Yield", "Date"]);

        manager(transport.clone(), 5_000)
            .dispatch(&command, &registry(3))
            .await
            .unwrap();

        let mut requests = transport.requests();
        requests.sort_by_key(|r| r.worker_index);
        assert_eq!(requests.len(), 3);
        for (i, request) in requests.iter().enumerate() {
            assert_eq!(request.worker_index, i);
            assert_eq!(Some(&request.parameters), command.batch().get(i));
            assert_eq!(request.command_id, command.command_id());
            assert_eq!(request.report_name, "Report");
            assert_eq!(request.columns, vec!["Yield", "Date"]);
        }
        let ids: std::collections::HashSet<_> = requests.iter().map(|r| r.request_id).collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_protocol_version_mismatch_fails_dispatch() {
        let transport =
            Arc::new(MockTransport::new(ScriptedEngine::new()).protocol_version_on(1, "0.9"));
        let command = tiller_command(&["0.1", "0.2"], &["Yield"]);

        let err = manager(transport, 5_000)
            .dispatch(&command, &registry(2))
            .await
            .unwrap_err();

        match err {
            DispatchError::WorkerExecutionFailed {
                index: 1,
                cause: WorkerFailure::Protocol(message),
            } => assert!(message.contains("0.9")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_size_mismatch_sends_nothing() {
        let transport = Arc::new(MockTransport::new(ScriptedEngine::new()));
        let command = tiller_command(&["0.1", "0.2", "0.3"], &["Yield"]);

        let err = manager(transport.clone(), 5_000)
            .dispatch(&command, &registry(2))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DispatchError::SizeMismatch {
                batch_len: 3,
                worker_count: 2
            }
        );
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_fails_whole_dispatch() {
        let transport = Arc::new(MockTransport::new(ScriptedEngine::new()).hang_on(1));
        let command = tiller_command(&["0.1", "0.2", "0.3"], &["Yield"]);

        let err = manager(transport.clone(), 100)
            .dispatch(&command, &registry(3))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DispatchError::WorkerExecutionFailed {
                index: 1,
                cause: WorkerFailure::Timeout { timeout_ms: 100 }
            }
        );
        assert!(err.is_timeout());
        assert_eq!(err.worker_index(), Some(1));
    }

    #[tokio::test]
    async fn test_simulation_failure_is_reported_with_index() {
        let engine = ScriptedEngine::new().failing_when(TILLER_INTERCEPT, "0.2");
        let transport = Arc::new(MockTransport::new(engine));
        let command = tiller_command(&["0.1", "0.2", "0.3"], &["Yield"]);

        let err = manager(transport, 5_000)
            .dispatch(&command, &registry(3))
            .await
            .unwrap_err();

        match err {
            DispatchError::WorkerExecutionFailed {
                index: 1,
                cause: WorkerFailure::Simulation(message),
            } => assert!(message.contains("0.2")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failure_cancels_outstanding_requests() {
        let transport = Arc::new(
            MockTransport::new(ScriptedEngine::new())
                .hang_on(0)
                .hang_on(2)
                .fail_transport_on(1),
        );
        let command = tiller_command(&["0.1", "0.2", "0.3"], &["Yield"]);

        let err = manager(transport.clone(), 60_000)
            .dispatch(&command, &registry(3))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::WorkerExecutionFailed {
                index: 1,
                cause: WorkerFailure::Transport(_)
            }
        ));

        // the two hung requests must be released promptly
        tokio::time::timeout(Duration::from_secs(2), transport.wait_for_released(2))
            .await
            .expect("hung requests were not released");
    }

    #[tokio::test]
    async fn test_external_cancellation() {
        let transport = Arc::new(MockTransport::new(ScriptedEngine::new()).hang_on(0).hang_on(1));
        let command = tiller_command(&["0.1", "0.2"], &["Yield"]);
        let registry = registry(2);
        let manager = manager(transport.clone(), 60_000);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = manager
            .dispatch_with_cancellation(&command, &registry, &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, DispatchError::Cancelled);
        assert_eq!(registry.count(), 2);
        tokio::time::timeout(Duration::from_secs(2), transport.wait_for_released(2))
            .await
            .expect("cancelled requests were not released");
    }

    #[tokio::test]
    async fn test_missing_column_surfaces_from_aggregation() {
        let transport = Arc::new(MockTransport::new(ScriptedEngine::new()));
        let command = tiller_command(&["0.1", "0.2"], &["Yield", "NoSuchColumn"]);

        let err = manager(transport, 5_000)
            .dispatch(&command, &registry(2))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::ColumnMissing { ref name, .. } if name == "NoSuchColumn"
        ));
    }

    #[tokio::test]
    async fn test_sequential_dispatches_are_independent() {
        let transport = Arc::new(MockTransport::new(ScriptedEngine::new()));
        let manager = manager(transport.clone(), 5_000);
        let registry = registry(2);

        let first = manager
            .dispatch(&tiller_command(&["0.1", "0.2"], &["Yield"]), &registry)
            .await
            .unwrap();
        let second = manager
            .dispatch(&tiller_command(&["0.5", "0.6"], &["Yield"]), &registry)
            .await
            .unwrap();

        assert_ne!(first.command_id(), second.command_id());
        assert_eq!(second.len(), 2);
        assert_eq!(
            second.get(0).unwrap().first_row().unwrap().get(0),
            Some(ScriptedEngine::expected_yield("0.5").as_str())
        );
        assert_eq!(
            first.get(0).unwrap().first_row().unwrap().get(0),
            Some(ScriptedEngine::expected_yield("0.1").as_str())
        );
        assert_eq!(transport.request_count(), 4);
    }

    #[test]
    fn test_dispatch_error_worker_index() {
        assert_eq!(
            DispatchError::SizeMismatch {
                batch_len: 1,
                worker_count: 2
            }
            .worker_index(),
            None
        );
        assert_eq!(
            DispatchError::MalformedPayload {
                worker_index: 4,
                reason: "x".to_string()
            }
            .worker_index(),
            Some(4)
        );
    }
}
