//! Typed front end for query-row-stream operations.
//!
//! A [`QueryRequest`] serializes to the JSON envelope the query service
//! expects and becomes a regular command descriptor, so queries ride the same
//! scheduling and completion machinery as key-value operations. Rows stream
//! back as non-terminal [`crate::Outcome::Row`] callback invocations; the
//! final frame completes the operation with the metadata payload.

use serde::{Deserialize, Serialize};

use crate::command::{CommandBuilder, CommandDescriptor};
use crate::error::Result;

/// One query, statement plus positional arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub statement: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<serde_json::Value>,
}

impl QueryRequest {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            args: Vec::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Serialize into a submittable descriptor.
    pub fn into_descriptor(self) -> Result<CommandBuilder> {
        let body = serde_json::to_vec(&self)?;
        Ok(CommandDescriptor::query(body))
    }
}

/// Metadata carried by the final frame of a query stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMeta {
    #[serde(rename = "rowCount")]
    pub row_count: u64,
}

/// Parse one streamed row payload as JSON.
pub fn parse_row(payload: &[u8]) -> Result<serde_json::Value> {
    Ok(serde_json::from_slice(payload)?)
}
