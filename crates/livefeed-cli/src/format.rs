//! Output formatting for the livefeed CLI
//!
//! Snapshots go to stdout in the selected format:
//! - Table: ASCII table with the query's columns (default)
//! - JSON: one pretty-printed document per snapshot
//! - YAML: one document per snapshot
//!
//! Status and informational lines go to stderr so stdout stays parseable.

use crate::config::OutputFormat;
use anyhow::Result;
use colored::*;
use livefeed_client::{ConnectionStatus, ReconnectionState, SubscriptionSnapshot};
use livefeed_core::{ProtocolError, Row, Timestamp};
use serde::Serialize;
use serde_json::{Map, Value};
use tabled::{
    builder::Builder,
    settings::{object::Rows, Alignment, Modify, Style},
};

/// Machine-readable form of one printed snapshot
#[derive(Debug, Serialize)]
struct SnapshotDocument {
    watermark: Option<Timestamp>,
    snapshot_complete: bool,
    row_count: usize,
    rows: Vec<Map<String, Value>>,
}

pub struct Formatter {
    format: OutputFormat,
    colored: bool,
}

impl Formatter {
    pub fn new(format: OutputFormat, colored: bool) -> Self {
        Self { format, colored }
    }

    /// Print a snapshot of the live set
    pub fn print_snapshot(
        &self,
        snapshot: &SubscriptionSnapshot<Row>,
        watermark: Option<Timestamp>,
    ) -> Result<()> {
        match self.format {
            OutputFormat::Table => {
                let header = match watermark {
                    Some(ts) => format!(
                        "{} rows as of {}",
                        snapshot.data.len(),
                        ts.to_iso8601().unwrap_or_else(|_| ts.to_string())
                    ),
                    None => format!("{} rows", snapshot.data.len()),
                };
                if self.colored {
                    println!("{}", header.bold());
                } else {
                    println!("{}", header);
                }
                println!("{}", render_table(&snapshot.data));
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&document(snapshot, watermark))?
                );
            }
            OutputFormat::Yaml => {
                println!("{}", serde_yaml::to_string(&document(snapshot, watermark))?);
            }
        }
        Ok(())
    }

    /// Print a connection status change
    pub fn print_status(&self, state: &ReconnectionState) {
        let detail = match state.status {
            ConnectionStatus::Reconnecting => match state.next_retry_ms() {
                Some(ms) => format!(
                    " (attempt {}/{}, retry in {}ms)",
                    state.attempt, state.max_attempts, ms
                ),
                None => String::new(),
            },
            ConnectionStatus::Failed => format!(" after {} attempts", state.attempt),
            _ => String::new(),
        };

        let label = state.status.as_str();
        if self.colored {
            let label = match state.status {
                ConnectionStatus::Connected => label.green(),
                ConnectionStatus::Reconnecting => label.yellow(),
                ConnectionStatus::Failed => label.red(),
                ConnectionStatus::Disconnected => label.dimmed(),
            };
            eprintln!("{} {}{}", "connection:".bold(), label, detail);
        } else {
            eprintln!("connection: {}{}", label, detail);
        }
    }

    pub fn print_protocol_error(&self, error: &ProtocolError) {
        let message = match &error.code {
            Some(code) => format!("{} [{}]", error.message, code),
            None => error.message.clone(),
        };
        self.print_error(&message);
    }

    pub fn print_error(&self, message: &str) {
        if self.colored {
            eprintln!("{} {}", "error:".red().bold(), message);
        } else {
            eprintln!("error: {}", message);
        }
    }

    pub fn print_info(&self, message: &str) {
        if self.colored {
            eprintln!("{} {}", "info:".blue(), message);
        } else {
            eprintln!("info: {}", message);
        }
    }
}

fn document(snapshot: &SubscriptionSnapshot<Row>, watermark: Option<Timestamp>) -> SnapshotDocument {
    SnapshotDocument {
        watermark,
        snapshot_complete: snapshot.snapshot_complete,
        row_count: snapshot.data.len(),
        rows: snapshot.data.iter().map(Row::to_json_object).collect(),
    }
}

/// Render rows as a table, columns in query order
pub fn render_table(rows: &[Row]) -> String {
    let Some(first) = rows.first() else {
        return "(no rows)".to_string();
    };

    let mut builder = Builder::default();
    builder.push_record(first.columns().iter().cloned());
    for row in rows {
        builder.push_record(row.values().iter().map(cell));
    }

    let mut table = builder.build();
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));
    table.to_string()
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Row> {
        vec![
            Row::from_pairs([("id", json!(1)), ("name", json!("alice")), ("note", Value::Null)]),
            Row::from_pairs([("id", json!(2)), ("name", json!("bob")), ("note", json!(3.5))]),
        ]
    }

    #[test]
    fn test_table_keeps_column_order() {
        let table = render_table(&rows());
        let header = table.lines().nth(1).unwrap();
        let id = header.find("id").unwrap();
        let name = header.find("name").unwrap();
        let note = header.find("note").unwrap();
        assert!(id < name && name < note);
        assert!(table.contains("alice"));
        assert!(table.contains("NULL"));
        assert!(table.contains("3.5"));
    }

    #[test]
    fn test_empty_table() {
        assert_eq!(render_table(&[]), "(no rows)");
    }

    #[test]
    fn test_strings_are_unquoted() {
        assert_eq!(cell(&json!("x")), "x");
        assert_eq!(cell(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn test_document_shape() {
        let snapshot = SubscriptionSnapshot {
            data: rows(),
            error: None,
            snapshot_complete: true,
        };
        let value = serde_json::to_value(document(&snapshot, Some(Timestamp::from_millis(7)))).unwrap();
        assert_eq!(value["watermark"], json!(7));
        assert_eq!(value["row_count"], json!(2));
        assert_eq!(value["rows"][1]["name"], json!("bob"));
    }

    #[test]
    fn test_print_formats() {
        let snapshot = SubscriptionSnapshot {
            data: rows(),
            error: None,
            snapshot_complete: true,
        };
        for format in [OutputFormat::Table, OutputFormat::Json, OutputFormat::Yaml] {
            Formatter::new(format, false)
                .print_snapshot(&snapshot, Some(Timestamp::from_millis(1)))
                .unwrap();
        }
    }
}
