//! Decoded Stream Frames
//!
//! A subscription delivers three kinds of frames, in transport order:
//!
//! - **Data**: one upsert-envelope row. `Upsert` sets the value for its key,
//!   `Delete` is a tombstone for a previously seen key.
//! - **Progress**: a watermark. Every data frame at or below this timestamp
//!   has already been delivered.
//! - **Error**: the backend rejected the statement or failed mid-stream.
//!
//! How a row maps to its key, and to whatever record type the caller exposes,
//! is decided by the caller; a [`Row`] only carries column names and values.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::timestamp::Timestamp;

/// One decoded row: the user-facing columns of a data frame, without the
/// `mz_*` bookkeeping columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Column names are shared between all rows of one subscription.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Convenience constructor for tests and small tools.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let (columns, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(c, v)| (c.into(), v)).unzip();
        Self::new(columns.into(), values)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json_object(&self) -> Map<String, Value> {
        self.columns
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

/// Whether a data frame sets or removes its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOp {
    Upsert,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub timestamp: Timestamp,
    pub op: UpsertOp,
    pub row: Row,
}

/// A protocol-level failure reported by (or inferred from) the backend.
///
/// Cloneable so it can be latched into snapshots handed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ProtocolError {
    pub message: String,
    pub code: Option<String>,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(DataFrame),
    Progress { timestamp: Timestamp },
    Error(ProtocolError),
}

impl Frame {
    pub fn upsert(timestamp: Timestamp, row: Row) -> Self {
        Frame::Data(DataFrame {
            timestamp,
            op: UpsertOp::Upsert,
            row,
        })
    }

    pub fn delete(timestamp: Timestamp, row: Row) -> Self {
        Frame::Data(DataFrame {
            timestamp,
            op: UpsertOp::Delete,
            row,
        })
    }

    pub fn progress(timestamp: Timestamp) -> Self {
        Frame::Progress { timestamp }
    }

    pub fn error(error: ProtocolError) -> Self {
        Frame::Error(error)
    }

    /// Short label, used for logging and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Data(d) if d.op == UpsertOp::Delete => "delete",
            Frame::Data(_) => "upsert",
            Frame::Progress { .. } => "progress",
            Frame::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_lookup_by_column() {
        let row = Row::from_pairs([("id", json!(1)), ("name", json!("a"))]);
        assert_eq!(row.get("name"), Some(&json!("a")));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn test_row_to_json_object() {
        let row = Row::from_pairs([("id", json!(1)), ("v", json!(null))]);
        assert_eq!(Value::Object(row.to_json_object()), json!({"id": 1, "v": null}));
    }

    #[test]
    fn test_frame_kind() {
        let row = Row::from_pairs([("id", json!(1))]);
        let ts = Timestamp::from_millis(1);
        assert_eq!(Frame::upsert(ts, row.clone()).kind(), "upsert");
        assert_eq!(Frame::delete(ts, row).kind(), "delete");
        assert_eq!(Frame::progress(ts).kind(), "progress");
        assert_eq!(Frame::error(ProtocolError::new("boom")).kind(), "error");
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::with_code("relation \"t\" does not exist", "42P01");
        assert_eq!(err.to_string(), "relation \"t\" does not exist");
        assert_eq!(err.code.as_deref(), Some("42P01"));
    }
}
