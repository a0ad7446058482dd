//! Test support: a deterministic simulation engine and an in-process transport.
//!
//! [`ScriptedEngine`] stands in for the crop model. Its report is derived from
//! the numeric parameter values so tests can predict every cell.
//! [`MockTransport`] runs requests against an engine without sockets and can
//! delay, hang, or fail chosen workers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::execution::command::ParameterSet;
use crate::execution::message_protocols::{WorkerRequest, WorkerResponse};
use crate::execution::registry::WorkerEndpoint;
use crate::execution::transport::{TransportError, WorkerTransport};
use crate::execution::worker::{handle_request, ReportTable, SimulationEngine, SimulationError};

/// Wheat tiller standard deviation intercept, the parameter most tests vary
pub const TILLER_INTERCEPT: &str = "[Leaf].Parameters.tillerSdIntercept";

/// Columns produced by [`ScriptedEngine`]'s report, in report order
pub const SCRIPTED_COLUMNS: [&str; 4] = ["Date", "BiomassWt", "Yield", "Parameters"];

/// Parameter path that makes [`ScriptedEngine`] sleep for the given milliseconds
pub const DELAY_PARAMETER: &str = "[Relay].DelayMs";

/// Deterministic simulation engine.
///
/// The score of a run is the sum of every numeric replacement value. Row `r`
/// reports `BiomassWt = score * 1000 + r` and `Yield = score * 10 + r`.
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    report_name: String,
    rows: usize,
    failures: Vec<(String, String)>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self {
            report_name: "Report".to_string(),
            rows: 1,
            failures: Vec::new(),
        }
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_report_name(mut self, name: impl Into<String>) -> Self {
        self.report_name = name.into();
        self
    }

    /// Number of rows each run reports (one per simulated day)
    pub fn with_rows(mut self, rows: usize) -> Self {
        self.rows = rows;
        self
    }

    /// Fail any run whose `path` is set to `value`
    pub fn failing_when(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.failures.push((path.into(), value.into()));
        self
    }

    /// Stringified `Yield` of the first row for a run varying only the tiller intercept
    pub fn expected_yield(tiller_intercept: &str) -> String {
        let parameters = ParameterSet::new().with(TILLER_INTERCEPT, tiller_intercept);
        number(yield_for(score(&parameters), 0)).to_string()
    }

    fn report(&self, parameters: &ParameterSet) -> ReportTable {
        let score = score(parameters);
        let echo = parameters
            .iter()
            .map(|r| format!("{}={}", r.path, r.value))
            .collect::<Vec<_>>()
            .join(";");

        let mut table = ReportTable::new(SCRIPTED_COLUMNS);
        for row in 0..self.rows {
            table.push_row(vec![
                Value::from(format!("1990-01-{:02}", row % 31 + 1)),
                number(score * 1000.0 + row as f64),
                number(yield_for(score, row)),
                Value::from(echo.clone()),
            ]);
        }
        table
    }
}

#[async_trait]
impl SimulationEngine for ScriptedEngine {
    async fn run(
        &self,
        parameters: &ParameterSet,
        report_name: &str,
    ) -> Result<ReportTable, SimulationError> {
        if let Some(delay_ms) = parameters.value_of(DELAY_PARAMETER) {
            let delay_ms = delay_ms
                .parse::<u64>()
                .map_err(|e| SimulationError::InvalidParameter {
                    path: DELAY_PARAMETER.to_string(),
                    reason: e.to_string(),
                })?;
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        for (path, value) in &self.failures {
            if parameters.value_of(path) == Some(value.as_str()) {
                return Err(SimulationError::Failed(format!(
                    "model diverged with {path} = {value}"
                )));
            }
        }

        if report_name != self.report_name {
            return Err(SimulationError::UnknownReport {
                name: report_name.to_string(),
            });
        }

        Ok(self.report(parameters))
    }
}

fn score(parameters: &ParameterSet) -> f64 {
    parameters
        .iter()
        .filter(|r| r.path != DELAY_PARAMETER)
        .filter_map(|r| r.value.parse::<f64>().ok())
        .sum()
}

fn yield_for(score: f64, row: usize) -> f64 {
    score * 10.0 + row as f64
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// In-process transport running requests straight against an engine
#[derive(Debug)]
pub struct MockTransport {
    engine: ScriptedEngine,
    delays: HashMap<usize, Duration>,
    hung: HashSet<usize>,
    broken: HashSet<usize>,
    protocol_versions: HashMap<usize, String>,
    requests: AtomicUsize,
    seen: Mutex<Vec<WorkerRequest>>,
    released: watch::Sender<usize>,
}

impl MockTransport {
    pub fn new(engine: ScriptedEngine) -> Self {
        let (released, _) = watch::channel(0);
        Self {
            engine,
            delays: HashMap::new(),
            hung: HashSet::new(),
            broken: HashSet::new(),
            protocol_versions: HashMap::new(),
            requests: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            released,
        }
    }

    /// Hold worker `index`'s response for `delay`
    pub fn delay_on(mut self, index: usize, delay: Duration) -> Self {
        self.delays.insert(index, delay);
        self
    }

    /// Never answer worker `index`
    pub fn hang_on(mut self, index: usize) -> Self {
        self.hung.insert(index);
        self
    }

    /// Fail worker `index` with a closed connection
    pub fn fail_transport_on(mut self, index: usize) -> Self {
        self.broken.insert(index);
        self
    }

    /// Answer worker `index` as if it spoke protocol `version`
    pub fn protocol_version_on(mut self, index: usize, version: impl Into<String>) -> Self {
        self.protocol_versions.insert(index, version.into());
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Requests received so far, in arrival order
    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.seen.lock().clone()
    }

    /// Resolves once `count` requests have been dropped before answering
    pub async fn wait_for_released(&self, count: usize) {
        let mut released = self.released.subscribe();
        // the sender lives as long as self, so this cannot fail
        let _ = released.wait_for(|n| *n >= count).await;
    }
}

/// Counts a request as released if it is dropped before completing
struct ReleaseGuard<'a> {
    released: &'a watch::Sender<usize>,
    completed: bool,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.released.send_modify(|n| *n += 1);
        }
    }
}

#[async_trait]
impl WorkerTransport for MockTransport {
    async fn execute(
        &self,
        endpoint: &WorkerEndpoint,
        request: &WorkerRequest,
    ) -> Result<WorkerResponse, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(request.clone());

        let mut guard = ReleaseGuard {
            released: &self.released,
            completed: false,
        };

        let index = endpoint.index();
        if let Some(delay) = self.delays.get(&index) {
            tokio::time::sleep(*delay).await;
        }
        if self.hung.contains(&index) {
            std::future::pending::<()>().await;
        }
        if self.broken.contains(&index) {
            guard.completed = true;
            return Err(TransportError::ConnectionClosed {
                address: endpoint.address().to_string(),
            });
        }

        let mut response = handle_request(&self.engine, request).await;
        if let Some(version) = self.protocol_versions.get(&index) {
            response.protocol_version = version.clone();
        }
        guard.completed = true;
        Ok(response)
    }
}

/// Bind and start `count` worker servers on loopback, returning them in index order
pub async fn spawn_local_workers(
    count: usize,
    engine: ScriptedEngine,
) -> Result<Vec<crate::execution::worker::WorkerServer>, crate::execution::worker::WorkerServerError>
{
    let engine: Arc<dyn SimulationEngine> = Arc::new(engine);
    let mut servers = Vec::with_capacity(count);
    for _ in 0..count {
        let server =
            crate::execution::worker::WorkerServer::bind_shared("127.0.0.1:0", Arc::clone(&engine))
                .await?;
        server.start().await?;
        servers.push(server);
    }
    Ok(servers)
}
