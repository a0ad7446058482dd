//! Result Aggregator
//!
//! Decodes the report payload each worker returns into [`ResultRow`]s ordered
//! exactly as the command requested, and assembles them into an
//! [`AggregatedResult`] aligned with the parameter batch: entry `i` always
//! belongs to parameter set `i`.
//!
//! Expected payload shape:
//!
//! ```json
//! { "columns": ["Date", "Yield", "BiomassWt"], "rows": [["1990-06-01", 5.1, 812.0]] }
//! ```

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Stringified values of the requested columns for one output row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRow {
    values: Vec<String>,
}

impl ResultRow {
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn get(&self, column: usize) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn join(&self, separator: &str) -> String {
        self.values.join(separator)
    }
}

impl fmt::Display for ResultRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.join(","))
    }
}

/// Rows produced by one worker, in report order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResult {
    worker_index: usize,
    rows: Vec<ResultRow>,
}

impl WorkerResult {
    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    /// First output row; every successful worker produces at least one
    pub fn first_row(&self) -> Option<&ResultRow> {
        self.rows.first()
    }
}

/// Outcome of one successful dispatch, index-aligned to the parameter batch
#[derive(Debug, Clone)]
pub struct AggregatedResult {
    command_id: Uuid,
    columns: Vec<String>,
    results: Vec<WorkerResult>,
    elapsed: Duration,
}

impl AggregatedResult {
    pub fn command_id(&self) -> Uuid {
        self.command_id
    }

    /// Column names, in the order values appear in every row
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Result for batch position `index`
    pub fn get(&self, index: usize) -> Option<&WorkerResult> {
        self.results.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerResult> {
        self.results.iter()
    }

    /// Every row of every worker, flattened in worker-index order
    pub fn rows(&self) -> impl Iterator<Item = &ResultRow> {
        self.results.iter().flat_map(|r| r.rows.iter())
    }

    /// Wall time of the dispatch that produced this result
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn into_results(self) -> Vec<WorkerResult> {
        self.results
    }
}

/// Decodes worker payloads against a requested column list
#[derive(Debug, Clone, Copy)]
pub struct ResultAggregator<'a> {
    columns: &'a [String],
}

impl<'a> ResultAggregator<'a> {
    pub fn new(columns: &'a [String]) -> Self {
        Self { columns }
    }

    /// Decode one worker's report table into rows restricted and ordered to
    /// the requested columns
    pub fn decode(
        &self,
        worker_index: usize,
        payload: &Value,
    ) -> Result<Vec<ResultRow>, AggregationError> {
        let malformed = |reason: &str| AggregationError::MalformedPayload {
            worker_index,
            reason: reason.to_string(),
        };

        let table = payload
            .as_object()
            .ok_or_else(|| malformed("report payload is not an object"))?;

        let header = table
            .get("columns")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed("missing 'columns' array"))?;

        let mut positions: HashMap<&str, usize> = HashMap::with_capacity(header.len());
        for (position, name) in header.iter().enumerate() {
            let name = name
                .as_str()
                .ok_or_else(|| malformed("column names must be strings"))?;
            if positions.insert(name, position).is_some() {
                return Err(malformed(&format!("column '{name}' appears twice")));
            }
        }

        // resolve requested columns up front so a missing one is reported by name
        let selection: Vec<usize> = self
            .columns
            .iter()
            .map(|name| {
                positions
                    .get(name.as_str())
                    .copied()
                    .ok_or_else(|| AggregationError::ColumnMissing {
                        name: name.clone(),
                        worker_index,
                    })
            })
            .collect::<Result<_, _>>()?;

        let rows = table
            .get("rows")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed("missing 'rows' array"))?;

        if rows.is_empty() {
            return Err(malformed("report contains no rows"));
        }

        rows.iter()
            .map(|row| {
                let cells = row
                    .as_array()
                    .ok_or_else(|| malformed("row is not an array"))?;
                if cells.len() != header.len() {
                    return Err(malformed(&format!(
                        "row has {} values for {} columns",
                        cells.len(),
                        header.len()
                    )));
                }
                selection
                    .iter()
                    .map(|&position| {
                        stringify(&cells[position])
                            .ok_or_else(|| malformed("nested values are not supported"))
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(ResultRow::new)
            })
            .collect()
    }

    /// Assemble per-worker payloads into an [`AggregatedResult`].
    ///
    /// `payloads[i]` must be the report returned by worker `i`.
    pub fn aggregate(
        &self,
        command_id: Uuid,
        payloads: Vec<Value>,
        elapsed: Duration,
    ) -> Result<AggregatedResult, AggregationError> {
        let results = payloads
            .iter()
            .enumerate()
            .map(|(worker_index, payload)| {
                self.decode(worker_index, payload)
                    .map(|rows| WorkerResult { worker_index, rows })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AggregatedResult {
            command_id,
            columns: self.columns.to_vec(),
            results,
            elapsed,
        })
    }
}

/// JSON scalar to its result-table text form
fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Decode-time contract violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregationError {
    #[error("Worker {worker_index} report is missing requested column '{name}'")]
    ColumnMissing { name: String, worker_index: usize },

    #[error("Worker {worker_index} returned a malformed payload: {reason}")]
    MalformedPayload { worker_index: usize, reason: String },
}
