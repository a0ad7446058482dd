//! Worker endpoint server
//!
//! The worker side of the dispatch protocol: accepts connections from the job
//! manager, applies each request's parameter set to a fresh simulation run via
//! a [`SimulationEngine`], and answers with the requested report table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::execution::command::ParameterSet;
use crate::execution::message_protocols::{WorkerRequest, WorkerResponse};

/// Largest request line a worker accepts by default
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// A simulation run: apply parameters to a fresh model instance, run it to
/// completion, and return the named report table.
#[async_trait]
pub trait SimulationEngine: Send + Sync + 'static {
    async fn run(
        &self,
        parameters: &ParameterSet,
        report_name: &str,
    ) -> Result<ReportTable, SimulationError>;
}

/// Tabular simulation output, one inner vector per report row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ReportTable {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    /// Keep only the requested columns that exist, in report order.
    ///
    /// Reordering and missing-column detection happen on the coordinator.
    /// Every row must be exactly as wide as the header.
    pub fn restrict_to(&self, requested: &[String]) -> Result<ReportTable, SimulationError> {
        if let Some((row, cells)) = self
            .rows
            .iter()
            .enumerate()
            .find(|(_, cells)| cells.len() != self.columns.len())
        {
            return Err(SimulationError::MalformedRow {
                row,
                expected: self.columns.len(),
                found: cells.len(),
            });
        }

        let keep: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, name)| requested.contains(name))
            .map(|(position, _)| position)
            .collect();

        Ok(ReportTable {
            columns: keep.iter().map(|&p| self.columns[p].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| keep.iter().map(|&p| row[p].clone()).collect())
                .collect(),
        })
    }

    pub fn into_payload(self) -> Value {
        serde_json::json!({ "columns": self.columns, "rows": self.rows })
    }
}

/// Simulation errors reported back to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimulationError {
    #[error("Report '{name}' not found")]
    UnknownReport { name: String },

    #[error("Invalid value for {path}: {reason}")]
    InvalidParameter { path: String, reason: String },

    #[error("Report row {row} has {found} cells but the header has {expected}")]
    MalformedRow {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("Simulation failed: {0}")]
    Failed(String),
}

/// Execute one request against `engine` and build the response
pub async fn handle_request(engine: &dyn SimulationEngine, request: &WorkerRequest) -> WorkerResponse {
    let started = Instant::now();

    let table = engine
        .run(&request.parameters, &request.report_name)
        .await
        .and_then(|table| table.restrict_to(&request.columns));

    let response = match table {
        Ok(table) => WorkerResponse::completed(request, table.into_payload()),
        Err(e) => {
            warn!(
                worker_index = request.worker_index,
                error = %e,
                "Simulation run failed"
            );
            WorkerResponse::failed(request, e.to_string())
        }
    };

    response.with_execution_time(started.elapsed().as_millis() as u64)
}

/// TCP server hosting one simulation worker
///
/// # Examples
///
/// ```rust,no_run
/// use sim_relay::execution::worker::WorkerServer;
/// use sim_relay::testing::ScriptedEngine;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let server = WorkerServer::bind("127.0.0.1:0", ScriptedEngine::new()).await?;
/// server.start().await?;
/// println!("worker listening on {}", server.local_addr());
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WorkerServer {
    local_addr: SocketAddr,
    engine: Arc<dyn SimulationEngine>,
    listener: Arc<Mutex<Option<TcpListener>>>,
    shutdown_tx: broadcast::Sender<()>,
    state: Arc<RwLock<ServerState>>,
    requests_handled: Arc<AtomicU64>,
    max_request_bytes: usize,
}

impl WorkerServer {
    /// Bind the listening socket; requests are served once [`start`](Self::start) is called
    pub async fn bind(
        address: &str,
        engine: impl SimulationEngine,
    ) -> Result<Self, WorkerServerError> {
        Self::bind_shared(address, Arc::new(engine)).await
    }

    pub async fn bind_shared(
        address: &str,
        engine: Arc<dyn SimulationEngine>,
    ) -> Result<Self, WorkerServerError> {
        let listener =
            TcpListener::bind(address)
                .await
                .map_err(|e| WorkerServerError::BindFailed {
                    address: address.to_string(),
                    error: e.to_string(),
                })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| WorkerServerError::BindFailed {
                address: address.to_string(),
                error: e.to_string(),
            })?;

        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            local_addr,
            engine,
            listener: Arc::new(Mutex::new(Some(listener))),
            shutdown_tx,
            state: Arc::new(RwLock::new(ServerState::default())),
            requests_handled: Arc::new(AtomicU64::new(0)),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        })
    }

    /// Cap the size of a single request line; longer lines drop the connection
    pub fn with_max_request_bytes(mut self, max_request_bytes: usize) -> Self {
        self.max_request_bytes = max_request_bytes;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the accept loop
    pub async fn start(&self) -> Result<(), WorkerServerError> {
        let mut state = self.state.write().await;
        if state.running {
            return Err(WorkerServerError::AlreadyRunning);
        }

        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(WorkerServerError::AlreadyStopped)?;

        state.running = true;
        state.start_time = Some(chrono::Utc::now());
        drop(state);

        info!(address = %self.local_addr, "Worker server listening");

        let server = self.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            server.accept_connections(listener, shutdown_rx).await;
        });

        Ok(())
    }

    /// Stop accepting connections and close open ones
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        if !state.running {
            return;
        }

        let _ = self.shutdown_tx.send(());
        state.running = false;
        info!(address = %self.local_addr, "Worker server stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.running
    }

    pub async fn get_stats(&self) -> WorkerServerStats {
        let state = self.state.read().await;
        WorkerServerStats {
            running: state.running,
            started_at: state.start_time,
            total_connections: state.total_connections,
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
        }
    }

    async fn accept_connections(
        &self,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Accepted coordinator connection");
                            self.state.write().await.total_connections += 1;

                            let server = self.clone();
                            let connection_shutdown = self.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer, connection_shutdown).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    debug!("Accept loop shutting down");
                    break;
                }
            }
        }
    }

    /// Serve newline-delimited requests on one connection, in order
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let limit = self.max_request_bytes as u64;

        loop {
            line.clear();
            let mut limited = (&mut reader).take(limit + 1);
            let read = tokio::select! {
                read = limited.read_line(&mut line) => read,
                _ = shutdown_rx.recv() => break,
            };

            match read {
                Ok(0) => break,
                Ok(n) if n as u64 > limit && !line.ends_with('\n') => {
                    warn!(%peer, limit = self.max_request_bytes, "Request line too large");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%peer, "Error reading from connection: {}", e);
                    break;
                }
            }

            let request: WorkerRequest = match serde_json::from_str(line.trim()) {
                Ok(request) => request,
                Err(e) => {
                    // no request id to answer with, so drop the connection
                    warn!(%peer, "Failed to parse request: {}", e);
                    break;
                }
            };

            debug!(
                worker_index = request.worker_index,
                request_id = %request.request_id,
                "Running simulation"
            );

            let response = tokio::select! {
                response = handle_request(self.engine.as_ref(), &request) => response,
                _ = shutdown_rx.recv() => break,
            };
            self.requests_handled.fetch_add(1, Ordering::Relaxed);

            let mut message = match serde_json::to_vec(&response) {
                Ok(message) => message,
                Err(e) => {
                    error!("Failed to serialize response: {}", e);
                    break;
                }
            };
            message.push(b'\n');

            if let Err(e) = writer.write_all(&message).await {
                warn!(%peer, "Failed to send response: {}", e);
                break;
            }
        }

        debug!(%peer, "Connection closed");
    }
}

impl std::fmt::Debug for WorkerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct ServerState {
    running: bool,
    start_time: Option<chrono::DateTime<chrono::Utc>>,
    total_connections: u64,
}

/// Worker server statistics
#[derive(Debug, Clone)]
pub struct WorkerServerStats {
    pub running: bool,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub total_connections: u64,
    pub requests_handled: u64,
}

/// Worker server errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerServerError {
    #[error("Failed to bind to address {address}: {error}")]
    BindFailed { address: String, error: String },

    #[error("Worker server is already running")]
    AlreadyRunning,

    #[error("Worker server has been stopped and cannot be restarted")]
    AlreadyStopped,
}
