//! SQL-over-WebSocket wire messages and the `SUBSCRIBE` output decoder.
//!
//! ## Message Format
//!
//! Every server message is a JSON object `{"type": T, "payload": P}`:
//!
//! ```text
//! {"type":"ReadyForQuery","payload":"I"}
//! {"type":"CommandStarting","payload":{"has_rows":true,"is_streaming":true}}
//! {"type":"Rows","payload":{"columns":[{"name":"mz_timestamp",...},...]}}
//! {"type":"Row","payload":["1700000000000",false,"upsert",1,"a"]}
//! {"type":"Error","payload":{"message":"...","code":"42P01"}}
//! ```
//!
//! A `SUBSCRIBE ... WITH (PROGRESS) ENVELOPE UPSERT` statement produces rows
//! whose leading columns are `mz_timestamp`, `mz_progressed` and `mz_state`;
//! the remaining columns belong to the query. [`SubscribeDecoder`] turns each
//! row into a [`Frame`].
//!
//! Decoding never panics. Anything it cannot make sense of becomes a
//! `Frame::Error` with code [`DECODE_ERROR_CODE`].

use std::collections::BTreeMap;
use std::sync::Arc;

use livefeed_core::{Frame, ProtocolError, Row, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

/// Error code attached to frames the decoder could not interpret.
pub const DECODE_ERROR_CODE: &str = "decode";

/// Error code for an upsert key that matched more than one row.
pub const KEY_VIOLATION_CODE: &str = "key_violation";

const TIMESTAMP_COLUMN: &str = "mz_timestamp";
const PROGRESSED_COLUMN: &str = "mz_progressed";
const STATE_COLUMN: &str = "mz_state";

/// Message types this decoder understands. Anything else comes from a newer
/// server and is skipped.
const KNOWN_TYPES: &[&str] = &[
    "ReadyForQuery",
    "CommandStarting",
    "Rows",
    "Row",
    "CommandComplete",
    "Error",
    "Notice",
    "ParameterStatus",
    "BackendKeyData",
];

/// First message on a new socket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

/// A statement to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMessage {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_oid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_len: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_mod: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowsDescription {
    pub columns: Vec<ColumnDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStarting {
    pub has_rows: bool,
    pub is_streaming: bool,
}

/// Payload of `Error` and `Notice` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNotice {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendKeyData {
    pub conn_id: u32,
    pub secret_key: u32,
}

/// One server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WebSocketResponse {
    ReadyForQuery(String),
    CommandStarting(CommandStarting),
    Rows(RowsDescription),
    Row(Vec<Value>),
    CommandComplete(String),
    Error(ServerNotice),
    Notice(ServerNotice),
    ParameterStatus(ParameterStatus),
    BackendKeyData(BackendKeyData),
}

impl From<ServerNotice> for ProtocolError {
    fn from(notice: ServerNotice) -> Self {
        let message = match notice.detail {
            Some(detail) => format!("{}: {}", notice.message, detail),
            None => notice.message,
        };
        ProtocolError {
            message,
            code: notice.code,
        }
    }
}

fn decode_error(message: impl Into<String>) -> Frame {
    Frame::error(ProtocolError::with_code(message, DECODE_ERROR_CODE))
}

#[derive(Debug, Clone)]
struct Layout {
    timestamp: usize,
    progressed: usize,
    state: usize,
    data: Vec<usize>,
    columns: Arc<[String]>,
    width: usize,
}

impl Layout {
    fn from_description(description: &RowsDescription) -> Result<Self, String> {
        let position = |name: &str| {
            description
                .columns
                .iter()
                .position(|c| c.name == name)
                .ok_or_else(|| format!("subscribe output is missing column {name}"))
        };
        let timestamp = position(TIMESTAMP_COLUMN)?;
        let progressed = position(PROGRESSED_COLUMN)?;
        let state = position(STATE_COLUMN)?;

        let data: Vec<usize> = (0..description.columns.len())
            .filter(|i| ![timestamp, progressed, state].contains(i))
            .collect();
        let columns: Vec<String> = data
            .iter()
            .map(|&i| description.columns[i].name.clone())
            .collect();

        Ok(Self {
            timestamp,
            progressed,
            state,
            data,
            columns: columns.into(),
            width: description.columns.len(),
        })
    }
}

/// Stateful decoder for one `SUBSCRIBE` result stream.
///
/// The `Rows` message fixes the column layout; every following `Row` is
/// decoded against it until [`reset`](Self::reset) or the next `Rows`.
#[derive(Debug, Default)]
pub struct SubscribeDecoder {
    layout: Option<Layout>,
}

impl SubscribeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the column layout, e.g. when a new socket is opened.
    pub fn reset(&mut self) {
        self.layout = None;
    }

    /// Column names of decoded rows, once a `Rows` message has been seen.
    pub fn columns(&self) -> Option<&[String]> {
        self.layout.as_ref().map(|l| &*l.columns)
    }

    /// Parse and decode one text message.
    pub fn decode_text(&mut self, text: &str) -> Option<Frame> {
        match serde_json::from_str::<WebSocketResponse>(text) {
            Ok(response) => self.decode(response),
            Err(e) => {
                if let Some(kind) = unknown_type(text) {
                    trace!(kind = %kind, "Ignoring unknown server message type");
                    return None;
                }
                warn!(error = %e, "Undecodable server message");
                Some(decode_error(format!("undecodable server message: {e}")))
            }
        }
    }

    pub fn decode(&mut self, response: WebSocketResponse) -> Option<Frame> {
        match response {
            WebSocketResponse::Rows(description) => {
                match Layout::from_description(&description) {
                    Ok(layout) => {
                        debug!(columns = ?layout.columns, "Subscribe columns described");
                        self.layout = Some(layout);
                        None
                    }
                    Err(message) => {
                        self.layout = None;
                        Some(decode_error(message))
                    }
                }
            }
            WebSocketResponse::Row(values) => Some(self.decode_row(values)),
            WebSocketResponse::Error(notice) => Some(Frame::error(notice.into())),
            WebSocketResponse::Notice(notice) => {
                debug!(message = %notice.message, severity = ?notice.severity, "Server notice");
                None
            }
            WebSocketResponse::CommandComplete(tag) => {
                debug!(tag = %tag, "Command complete");
                self.layout = None;
                None
            }
            other => {
                trace!(message = ?other, "Ignoring server message");
                None
            }
        }
    }

    fn decode_row(&self, mut values: Vec<Value>) -> Frame {
        let Some(layout) = &self.layout else {
            return decode_error("row received before column description");
        };
        if values.len() != layout.width {
            return decode_error(format!(
                "row has {} values, expected {}",
                values.len(),
                layout.width
            ));
        }

        let timestamp = match Timestamp::try_from(&values[layout.timestamp]) {
            Ok(ts) => ts,
            Err(e) => return decode_error(e.to_string()),
        };

        if values[layout.progressed] == Value::Bool(true) {
            return Frame::progress(timestamp);
        }

        let state = match &values[layout.state] {
            Value::String(s) => s.clone(),
            other => return decode_error(format!("unexpected {STATE_COLUMN} value {other}")),
        };

        let data: Vec<Value> = layout
            .data
            .iter()
            .map(|&i| std::mem::take(&mut values[i]))
            .collect();
        let row = Row::new(Arc::clone(&layout.columns), data);

        match state.as_str() {
            "upsert" => Frame::upsert(timestamp, row),
            "delete" => Frame::delete(timestamp, row),
            "key_violation" => Frame::error(ProtocolError::with_code(
                format!(
                    "upsert key matched more than one row at {} ({:?})",
                    timestamp,
                    row.to_json_object()
                ),
                KEY_VIOLATION_CODE,
            )),
            other => decode_error(format!("unexpected {STATE_COLUMN} value {other:?}")),
        }
    }
}

/// The `type` of a well-formed message that names no known type.
fn unknown_type(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let kind = value.get("type")?.as_str()?;
    (!KNOWN_TYPES.contains(&kind)).then(|| kind.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use livefeed_core::UpsertOp;
    use serde_json::json;

    const ROWS: &str = r#"{"type":"Rows","payload":{"columns":[
        {"name":"mz_timestamp","type_oid":1700,"type_len":-1,"type_mod":-1},
        {"name":"mz_progressed","type_oid":16,"type_len":1,"type_mod":-1},
        {"name":"mz_state","type_oid":25,"type_len":-1,"type_mod":-1},
        {"name":"id","type_oid":23,"type_len":4,"type_mod":-1},
        {"name":"v","type_oid":25,"type_len":-1,"type_mod":-1}]}}"#;

    fn described() -> SubscribeDecoder {
        let mut decoder = SubscribeDecoder::new();
        assert_eq!(decoder.decode_text(ROWS), None);
        decoder
    }

    fn row(values: Value) -> String {
        json!({"type": "Row", "payload": values}).to_string()
    }

    fn error_code(frame: Option<Frame>) -> Option<String> {
        match frame {
            Some(Frame::Error(e)) => e.code,
            _ => None,
        }
    }

    #[test]
    fn test_upsert_row() {
        let mut decoder = described();
        assert_eq!(
            decoder.columns(),
            Some(&["id".to_string(), "v".to_string()][..])
        );

        let frame = decoder
            .decode_text(&row(json!(["1700000000000", false, "upsert", 1, "a"])))
            .unwrap();
        match frame {
            Frame::Data(data) => {
                assert_eq!(data.op, UpsertOp::Upsert);
                assert_eq!(data.timestamp, Timestamp::from_millis(1_700_000_000_000));
                assert_eq!(data.row.get("id"), Some(&json!(1)));
                assert_eq!(data.row.get("v"), Some(&json!("a")));
                assert_eq!(data.row.len(), 2);
            }
            other => panic!("expected data frame, got {:?}", other),
        }
    }

    #[test]
    fn test_delete_row() {
        let mut decoder = described();
        let frame = decoder
            .decode_text(&row(json!(["5", false, "delete", 1, null])))
            .unwrap();
        assert_eq!(frame.kind(), "delete");
    }

    #[test]
    fn test_progress_row() {
        let mut decoder = described();
        let frame = decoder.decode_text(&row(json!([7, true, null, null, null])));
        assert_eq!(frame, Some(Frame::progress(Timestamp::from_millis(7))));
    }

    #[test]
    fn test_key_violation() {
        let mut decoder = described();
        let frame = decoder.decode_text(&row(json!(["5", false, "key_violation", 1, "a"])));
        assert_eq!(error_code(frame).as_deref(), Some(KEY_VIOLATION_CODE));
    }

    #[test]
    fn test_server_error() {
        let mut decoder = SubscribeDecoder::new();
        let frame = decoder.decode_text(
            r#"{"type":"Error","payload":{"message":"unknown catalog item 't'","code":"XX000"}}"#,
        );
        assert_eq!(
            frame,
            Some(Frame::error(ProtocolError::with_code(
                "unknown catalog item 't'",
                "XX000"
            )))
        );
    }

    #[test]
    fn test_row_before_description() {
        let mut decoder = SubscribeDecoder::new();
        let frame = decoder.decode_text(&row(json!(["5", false, "upsert", 1, "a"])));
        assert_eq!(error_code(frame).as_deref(), Some(DECODE_ERROR_CODE));
    }

    #[test]
    fn test_malformed_messages_become_errors() {
        let mut decoder = described();
        let messages = vec![
            "not json".to_string(),
            r#"{"payload":1}"#.to_string(),
            r#"{"type":"Row","payload":{"not":"a list"}}"#.to_string(),
            row(json!(["5", false, "upsert", 1])),
            row(json!([-1, false, "upsert", 1, "a"])),
            row(json!(["5", false, "teleport", 1, "a"])),
            row(json!(["5", false, 3, 1, "a"])),
        ];
        for text in &messages {
            assert_eq!(
                error_code(decoder.decode_text(text)).as_deref(),
                Some(DECODE_ERROR_CODE),
                "{}",
                text
            );
        }
    }

    #[test]
    fn test_unknown_message_types_are_skipped() {
        let mut decoder = described();
        assert_eq!(decoder.decode_text(r#"{"type":"Bogus","payload":1}"#), None);
        assert_eq!(decoder.decode_text(r#"{"type":"CopyInResponse"}"#), None);

        // The layout survives.
        let frame = decoder.decode_text(&row(json!(["5", false, "upsert", 1, "a"])));
        assert_eq!(frame.map(|f| f.kind()), Some("upsert"));
    }

    #[test]
    fn test_missing_bookkeeping_column() {
        let mut decoder = SubscribeDecoder::new();
        let frame = decoder.decode_text(
            r#"{"type":"Rows","payload":{"columns":[{"name":"mz_timestamp"},{"name":"id"}]}}"#,
        );
        assert_eq!(error_code(frame).as_deref(), Some(DECODE_ERROR_CODE));
        assert!(decoder.columns().is_none());
    }

    #[test]
    fn test_session_messages_are_silent() {
        let mut decoder = SubscribeDecoder::new();
        for text in [
            r#"{"type":"ReadyForQuery","payload":"I"}"#,
            r#"{"type":"CommandStarting","payload":{"has_rows":true,"is_streaming":true}}"#,
            r#"{"type":"ParameterStatus","payload":{"name":"TimeZone","value":"UTC"}}"#,
            r#"{"type":"BackendKeyData","payload":{"conn_id":7,"secret_key":42}}"#,
            r#"{"type":"Notice","payload":{"message":"hi","severity":"notice"}}"#,
        ] {
            assert_eq!(decoder.decode_text(text), None, "{}", text);
        }
    }

    #[test]
    fn test_client_messages_serialize() {
        let auth = AuthMessage {
            user: Some("materialize".into()),
            password: None,
            options: BTreeMap::from([("cluster".to_string(), "quickstart".to_string())]),
        };
        assert_eq!(
            serde_json::to_value(&auth).unwrap(),
            json!({"user": "materialize", "options": {"cluster": "quickstart"}})
        );

        let query = QueryMessage {
            query: "SELECT 1".into(),
        };
        assert_eq!(serde_json::to_string(&query).unwrap(), r#"{"query":"SELECT 1"}"#);
    }
}
