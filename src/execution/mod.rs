pub mod aggregator;
pub mod command;
pub mod job_manager;
pub mod message_protocols;
pub mod registry;
pub mod transport;
pub mod worker;

pub use aggregator::{AggregatedResult, AggregationError, ResultAggregator, ResultRow, WorkerResult};
pub use command::{Command, CommandError, ParameterBatch, ParameterSet, PropertyReplacement};
pub use job_manager::{DispatchError, JobManager, JobManagerConfig, WorkerFailure};
pub use message_protocols::{WorkerOutcome, WorkerRequest, WorkerResponse};
pub use registry::{RegistryError, WorkerEndpoint, WorkerEndpointRegistry};
pub use transport::{TcpTransport, TcpTransportConfig, TransportError, WorkerTransport};
pub use worker::{ReportTable, SimulationEngine, SimulationError, WorkerServer, WorkerServerError};
