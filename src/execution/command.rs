//! Command model for relaying parameterised simulation runs to the worker pool
//!
//! A [`Command`] pairs a [`ParameterBatch`] (one [`ParameterSet`] per worker
//! slot) with the name of the report table to read back and the columns to
//! extract from it. Everything in here is plain data: building a command never
//! touches the network.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::execution::message_protocols::WorkerRequest;

/// A single overridden simulation parameter, e.g.
/// `[Leaf].Parameters.tillerSdIntercept = 0.329`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyReplacement {
    /// Model path of the property being replaced
    pub path: String,

    /// Literal value applied to the property
    pub value: String,
}

impl PropertyReplacement {
    pub fn new(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
        }
    }
}

/// Ordered replacements applied together to one worker's run.
///
/// The same path may appear more than once; the worker receives the list as
/// given and decides how to apply it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    replacements: Vec<PropertyReplacement>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a replacement, builder style
    pub fn with(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(PropertyReplacement::new(path, value));
        self
    }

    pub fn push(&mut self, replacement: PropertyReplacement) {
        self.replacements.push(replacement);
    }

    pub fn replacements(&self) -> &[PropertyReplacement] {
        &self.replacements
    }

    /// Value of the first replacement targeting `path`
    pub fn value_of(&self, path: &str) -> Option<&str> {
        self.replacements
            .iter()
            .find(|r| r.path == path)
            .map(|r| r.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.replacements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyReplacement> {
        self.replacements.iter()
    }
}

impl FromIterator<PropertyReplacement> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = PropertyReplacement>>(iter: I) -> Self {
        Self {
            replacements: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<PropertyReplacement>> for ParameterSet {
    fn from(replacements: Vec<PropertyReplacement>) -> Self {
        Self { replacements }
    }
}

/// Per-dispatch sequence of parameter sets; entry `i` goes to worker `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterBatch {
    sets: Vec<ParameterSet>,
}

impl ParameterBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch of `count` copies of the same parameter set
    pub fn repeated(set: &ParameterSet, count: usize) -> Self {
        Self {
            sets: vec![set.clone(); count],
        }
    }

    pub fn push(&mut self, set: ParameterSet) {
        self.sets.push(set);
    }

    pub fn with(mut self, set: ParameterSet) -> Self {
        self.sets.push(set);
        self
    }

    pub fn get(&self, index: usize) -> Option<&ParameterSet> {
        self.sets.get(index)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterSet> {
        self.sets.iter()
    }
}

impl FromIterator<ParameterSet> for ParameterBatch {
    fn from_iter<I: IntoIterator<Item = ParameterSet>>(iter: I) -> Self {
        Self {
            sets: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<ParameterSet>> for ParameterBatch {
    fn from(sets: Vec<ParameterSet>) -> Self {
        Self { sets }
    }
}

/// Dispatchable unit: a parameter batch plus the report/columns to read back.
///
/// Immutable once constructed. Every worker receives a distinct parameter set
/// but an identical report name and column list.
///
/// # Examples
///
/// ```rust
/// use sim_relay::execution::command::{Command, ParameterBatch, ParameterSet};
///
/// let batch: ParameterBatch = ["0.1", "0.2", "0.3"]
///     .iter()
///     .map(|v| ParameterSet::new().with("[Leaf].Parameters.tillerSdIntercept", *v))
///     .collect();
///
/// let command = Command::new(batch, "Report", vec!["Yield".to_string()]).unwrap();
/// assert_eq!(command.batch().len(), 3);
/// assert_eq!(command.columns(), ["Yield"]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CommandFields")]
pub struct Command {
    command_id: Uuid,
    batch: ParameterBatch,
    report_name: String,
    columns: Vec<String>,
    created_at: DateTime<Utc>,
}

impl Command {
    /// Create a new command with a generated ID and the current timestamp
    pub fn new<S: Into<String>>(
        batch: ParameterBatch,
        report_name: impl Into<String>,
        columns: impl IntoIterator<Item = S>,
    ) -> Result<Self, CommandError> {
        let report_name = report_name.into();
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        validate(&batch, &report_name, &columns)?;

        Ok(Self {
            command_id: Uuid::new_v4(),
            batch,
            report_name,
            columns,
            created_at: Utc::now(),
        })
    }

    pub fn command_id(&self) -> Uuid {
        self.command_id
    }

    pub fn batch(&self) -> &ParameterBatch {
        &self.batch
    }

    pub fn report_name(&self) -> &str {
        &self.report_name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Same batch, report, and columns under a new command ID
    pub fn reissue(&self) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Build the execution request for worker slot `index`
    pub fn request_for(&self, index: usize) -> Option<WorkerRequest> {
        self.batch.get(index).map(|parameters| WorkerRequest {
            request_id: Uuid::new_v4(),
            command_id: self.command_id,
            worker_index: index,
            parameters: parameters.clone(),
            report_name: self.report_name.clone(),
            columns: self.columns.clone(),
        })
    }
}

fn validate(
    batch: &ParameterBatch,
    report_name: &str,
    columns: &[String],
) -> Result<(), CommandError> {
    if batch.is_empty() {
        return Err(CommandError::EmptyBatch);
    }

    if report_name.trim().is_empty() {
        return Err(CommandError::EmptyReportName);
    }

    if columns.is_empty() {
        return Err(CommandError::NoColumns);
    }

    let mut seen = HashSet::with_capacity(columns.len());
    for column in columns {
        if column.trim().is_empty() {
            return Err(CommandError::EmptyColumnName);
        }
        if !seen.insert(column.as_str()) {
            return Err(CommandError::DuplicateColumn {
                name: column.clone(),
            });
        }
    }
    Ok(())
}

/// Wire shape of a [`Command`]; deserialized commands go through the same
/// checks as [`Command::new`]
#[derive(Deserialize)]
struct CommandFields {
    command_id: Uuid,
    batch: ParameterBatch,
    report_name: String,
    columns: Vec<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<CommandFields> for Command {
    type Error = CommandError;

    fn try_from(fields: CommandFields) -> Result<Self, Self::Error> {
        validate(&fields.batch, &fields.report_name, &fields.columns)?;
        Ok(Self {
            command_id: fields.command_id,
            batch: fields.batch,
            report_name: fields.report_name,
            columns: fields.columns,
            created_at: fields.created_at,
        })
    }
}

/// Command construction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Parameter batch is empty")]
    EmptyBatch,

    #[error("Report name cannot be empty")]
    EmptyReportName,

    #[error("At least one result column must be requested")]
    NoColumns,

    #[error("Column names cannot be empty")]
    EmptyColumnName,

    #[error("Column '{name}' requested more than once")]
    DuplicateColumn { name: String },
}
