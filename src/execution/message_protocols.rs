use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::command::ParameterSet;

pub const PROTOCOL_VERSION: &str = "1.0";

/// Execution request sent from the job manager to a single worker
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    pub request_id: Uuid,
    pub command_id: Uuid,
    pub worker_index: usize,
    pub parameters: ParameterSet,
    pub report_name: String,
    pub columns: Vec<String>,
}

/// Worker reply to a [`WorkerRequest`], correlated by `request_id`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    pub request_id: Uuid,
    pub worker_index: usize,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    pub outcome: WorkerOutcome,
    pub execution_time_ms: Option<u64>,
}

/// What happened to the simulation run on the worker
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum WorkerOutcome {
    /// Run finished; `table` is the report payload, opaque until aggregation
    Completed { table: serde_json::Value },
    /// The worker could not produce a report
    Failed { message: String },
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl WorkerResponse {
    pub fn completed(request: &WorkerRequest, table: serde_json::Value) -> Self {
        Self {
            request_id: request.request_id,
            worker_index: request.worker_index,
            protocol_version: default_protocol_version(),
            outcome: WorkerOutcome::Completed { table },
            execution_time_ms: None,
        }
    }

    pub fn failed(request: &WorkerRequest, message: impl Into<String>) -> Self {
        Self {
            request_id: request.request_id,
            worker_index: request.worker_index,
            protocol_version: default_protocol_version(),
            outcome: WorkerOutcome::Failed {
                message: message.into(),
            },
            execution_time_ms: None,
        }
    }

    pub fn with_execution_time(mut self, execution_time_ms: u64) -> Self {
        self.execution_time_ms = Some(execution_time_ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_wire_shape() {
        let request = WorkerRequest {
            request_id: Uuid::new_v4(),
            command_id: Uuid::new_v4(),
            worker_index: 2,
            parameters: ParameterSet::new().with("[Phenology].TTEndJuvToInit", "160"),
            report_name: "Report".to_string(),
            columns: vec!["Yield".to_string()],
        };

        let response = WorkerResponse::failed(&request, "model diverged");
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["worker_index"], 2);
        assert_eq!(json["outcome"]["type"], "Failed");
        assert_eq!(json["outcome"]["data"]["message"], "model diverged");
    }

    #[test]
    fn test_parameters_serialize_as_plain_list() {
        let set = ParameterSet::new().with("[Leaf].Parameters.aMaxSlope", "22.25");
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{ "path": "[Leaf].Parameters.aMaxSlope", "value": "22.25" }])
        );
    }

    #[test]
    fn test_missing_protocol_version_defaults() {
        let raw = format!(
            r#"{{"request_id":"{}","worker_index":0,"outcome":{{"type":"Failed","data":{{"message":"x"}}}},"execution_time_ms":null}}"#,
            Uuid::nil()
        );
        let response: WorkerResponse = serde_json::from_str(&raw).unwrap();
        assert_eq!(response.protocol_version, PROTOCOL_VERSION);
    }
}
