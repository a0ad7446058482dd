//! Transport Layer Abstraction
//!
//! The job manager talks to workers through [`WorkerTransport`], so the
//! dispatch logic does not care whether requests go over TCP or stay
//! in-process (as in tests). The TCP implementation frames each message as a
//! single line of JSON and opens one connection per request.

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::execution::message_protocols::{WorkerRequest, WorkerResponse};
use crate::execution::registry::WorkerEndpoint;

/// Sends one execution request to one worker and returns its response.
///
/// Implementations must be cancel-safe: dropping the returned future releases
/// any connection it holds. Per-request timeouts are applied by the caller.
#[async_trait]
pub trait WorkerTransport: Send + Sync + Debug {
    async fn execute(
        &self,
        endpoint: &WorkerEndpoint,
        request: &WorkerRequest,
    ) -> Result<WorkerResponse, TransportError>;
}

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection establishment timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Largest response line accepted from a worker
    pub max_response_bytes: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            max_response_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Newline-delimited JSON over TCP
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    async fn connect(&self, endpoint: &WorkerEndpoint) -> Result<TcpStream, TransportError> {
        let address = endpoint.address();
        debug!(worker_index = endpoint.index(), %address, "Connecting to worker");

        timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            TcpStream::connect(address),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            address: address.to_string(),
            timeout_ms: self.config.connect_timeout_ms,
        })?
        .map_err(|e| TransportError::Connect {
            address: address.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl WorkerTransport for TcpTransport {
    async fn execute(
        &self,
        endpoint: &WorkerEndpoint,
        request: &WorkerRequest,
    ) -> Result<WorkerResponse, TransportError> {
        let address = endpoint.address().to_string();
        let io_error = |e: std::io::Error| TransportError::Io {
            address: address.clone(),
            message: e.to_string(),
        };

        let mut stream = self.connect(endpoint).await?;

        let mut line = serde_json::to_vec(request)
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        line.push(b'\n');

        stream.write_all(&line).await.map_err(io_error)?;
        stream.flush().await.map_err(io_error)?;

        let (reader, _writer) = stream.into_split();
        let limit = self.config.max_response_bytes as u64;
        let mut reader = BufReader::new(reader.take(limit + 1));
        let mut response_line = String::new();
        let read = reader.read_line(&mut response_line).await.map_err(io_error)?;

        if read == 0 {
            return Err(TransportError::ConnectionClosed { address });
        }
        if !response_line.ends_with('\n') && read as u64 > limit {
            return Err(TransportError::ResponseTooLarge {
                address,
                limit: self.config.max_response_bytes,
            });
        }

        debug!(
            worker_index = endpoint.index(),
            bytes = read,
            "Received response from worker"
        );

        let response: WorkerResponse =
            serde_json::from_str(response_line.trim_end()).map_err(|e| TransportError::Decode {
                address: address.clone(),
                message: e.to_string(),
            })?;

        if response.request_id != request.request_id {
            return Err(TransportError::CorrelationMismatch {
                expected: request.request_id.to_string(),
                found: response.request_id.to_string(),
            });
        }

        Ok(response)
    }
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to worker at {address}: {message}")]
    Connect { address: String, message: String },

    #[error("Connection timeout to worker at {address} after {timeout_ms}ms")]
    ConnectTimeout { address: String, timeout_ms: u64 },

    #[error("I/O error talking to worker at {address}: {message}")]
    Io { address: String, message: String },

    #[error("Failed to encode request: {0}")]
    Encode(String),

    #[error("Failed to decode response from worker at {address}: {message}")]
    Decode { address: String, message: String },

    #[error("Worker at {address} closed the connection without responding")]
    ConnectionClosed { address: String },

    #[error("Response from worker at {address} exceeds {limit} bytes")]
    ResponseTooLarge { address: String, limit: usize },

    #[error("Response correlation mismatch: expected request {expected}, got {found}")]
    CorrelationMismatch { expected: String, found: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::command::ParameterSet;
    use crate::execution::message_protocols::WorkerOutcome;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn request(index: usize) -> WorkerRequest {
        WorkerRequest {
            request_id: Uuid::new_v4(),
            command_id: Uuid::new_v4(),
            worker_index: index,
            parameters: ParameterSet::new().with("[Leaf].Parameters.aMaxSlope", "22.25"),
            report_name: "Report".to_string(),
            columns: vec!["Yield".to_string()],
        }
    }

    /// Accept one connection, read the request line and answer with `reply`
    async fn one_shot_server<F>(reply: F) -> std::net::SocketAddr
    where
        F: FnOnce(WorkerRequest) -> String + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let request: WorkerRequest = serde_json::from_str(line.trim()).unwrap();
            let reply = reply(request);
            writer.write_all(reply.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_round_trip_over_tcp() {
        let addr = one_shot_server(|request| {
            let response = WorkerResponse::completed(
                &request,
                serde_json::json!({ "columns": ["Yield"], "rows": [[1.5]] }),
            );
            format!("{}\n", serde_json::to_string(&response).unwrap())
        })
        .await;

        let transport = TcpTransport::default();
        let endpoint = WorkerEndpoint::new(0, addr);
        let request = request(0);
        let response = transport.execute(&endpoint, &request).await.unwrap();

        assert_eq!(response.request_id, request.request_id);
        assert!(matches!(response.outcome, WorkerOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_connection_closed_without_reply() {
        let addr = one_shot_server(|_| String::new()).await;

        let transport = TcpTransport::default();
        let err = transport
            .execute(&WorkerEndpoint::new(0, addr), &request(0))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_correlation_mismatch() {
        let addr = one_shot_server(|mut request| {
            request.request_id = Uuid::new_v4();
            let response = WorkerResponse::failed(&request, "wrong id");
            format!("{}\n", serde_json::to_string(&response).unwrap())
        })
        .await;

        let transport = TcpTransport::default();
        let err = transport
            .execute(&WorkerEndpoint::new(0, addr), &request(0))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::CorrelationMismatch { .. }));
    }

    #[tokio::test]
    async fn test_oversized_response_rejected() {
        let addr = one_shot_server(|_| format!("{}\n", "x".repeat(256))).await;

        let transport = TcpTransport::new(TcpTransportConfig {
            max_response_bytes: 64,
            ..TcpTransportConfig::default()
        });
        let err = transport
            .execute(&WorkerEndpoint::new(0, addr), &request(0))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::ResponseTooLarge { limit: 64, .. }));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TcpTransport::default();
        let err = transport
            .execute(&WorkerEndpoint::new(0, addr), &request(0))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
