//! Stream Reducer
//!
//! Folds an upsert-envelope change feed into a keyed live set.
//!
//! ## States
//!
//! ```text
//!                 open                 progress >= start
//! AwaitingConnection ──▶ AwaitingSnapshot ─────────────▶ Streaming
//!        ▲                    │                            │
//!        └──────── close ─────┴─────────── close ──────────┘
//!
//! error frame: AwaitingSnapshot | Streaming ──▶ Errored (until reset)
//! close():     any ──▶ Closed
//! ```
//!
//! ## Resumption
//!
//! The first statement uses the request as given. Every later statement on
//! the same logical subscription resumes from the last progress watermark
//! (`AS OF AT LEAST <watermark>`, never below the request's own bound), so
//! the retained live set stays valid:
//! data frames replayed at or after the watermark either hit a key that
//! already holds the same row or overwrite it with a newer one.
//!
//! [`ResumeMode::Rebuild`] instead stages the resumed stream into a fresh set
//! and swaps it in at the first qualifying progress frame. This also drops
//! keys that were deleted while disconnected when the backend re-sends a
//! full snapshot rather than a diff.
//!
//! [`reset`](StreamReducer::reset) never reuses a session that is still
//! streaming the previous statement: the caller replaces the connection and
//! the fresh statement goes out on the next open.
//!
//! The reducer performs no I/O. [`Subscription`](crate::Subscription) feeds
//! it connection events and frames and sends the statements it returns.

use std::collections::BTreeMap;
use std::sync::Arc;

use livefeed_core::{Frame, ProtocolError, Row, SubscribeRequest, Timestamp, UpsertKey, UpsertOp};
use tracing::{debug, warn};

/// Maps a row to the key it upserts.
pub type KeyFn = Arc<dyn Fn(&Row) -> String + Send + Sync>;

/// Separator between key columns in [`default_key_fn`]. A control character
/// that JSON-encoded values cannot contain unescaped.
const KEY_SEPARATOR: char = '\u{1f}';

/// Key function joining the JSON text of the upsert-key columns.
///
/// A column missing from the row contributes `null`.
pub fn default_key_fn(key: &UpsertKey) -> KeyFn {
    let columns = key.columns().to_vec();
    Arc::new(move |row: &Row| {
        let mut key = String::new();
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                key.push(KEY_SEPARATOR);
            }
            match row.get(column) {
                Some(value) => key.push_str(&value.to_string()),
                None => key.push_str("null"),
            }
        }
        key
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReducerState {
    AwaitingConnection,
    AwaitingSnapshot,
    Streaming,
    Errored,
    Closed,
}

impl ReducerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReducerState::AwaitingConnection => "awaiting_connection",
            ReducerState::AwaitingSnapshot => "awaiting_snapshot",
            ReducerState::Streaming => "streaming",
            ReducerState::Errored => "errored",
            ReducerState::Closed => "closed",
        }
    }

    fn is_folding(&self) -> bool {
        matches!(self, ReducerState::AwaitingSnapshot | ReducerState::Streaming)
    }
}

impl std::fmt::Display for ReducerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How frames after a reconnect are folded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResumeMode {
    /// Fold the resumed stream into the retained live set.
    #[default]
    Replay,
    /// Stage the resumed stream and swap it in at the first progress frame
    /// at or after the resumption point.
    Rebuild,
}

/// What folding one frame did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldOutcome {
    Applied,
    /// A watermark was recorded. `completed` is true only for the frame that
    /// first completed the snapshot.
    Progress {
        completed: bool,
    },
    Errored(ProtocolError),
    Ignored,
}

/// A statement the reducer wants sent on the open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub statement: String,
    /// The watermark the statement resumes from, if it is a resumption.
    pub resume_from: Option<Timestamp>,
}

pub struct StreamReducer {
    request: SubscribeRequest,
    key_fn: KeyFn,
    custom_key_fn: bool,
    resume_mode: ResumeMode,
    live: BTreeMap<String, Row>,
    staged: Option<BTreeMap<String, Row>>,
    watermark: Option<Timestamp>,
    start_at: Option<Timestamp>,
    snapshot_complete: bool,
    error: Option<ProtocolError>,
    state: ReducerState,
    issued: bool,
    connected: bool,
    version: u64,
}

impl StreamReducer {
    pub fn new(request: SubscribeRequest) -> Self {
        let key_fn = default_key_fn(request.upsert_key());
        Self {
            request,
            key_fn,
            custom_key_fn: false,
            resume_mode: ResumeMode::default(),
            live: BTreeMap::new(),
            staged: None,
            watermark: None,
            start_at: None,
            snapshot_complete: false,
            error: None,
            state: ReducerState::AwaitingConnection,
            issued: false,
            connected: false,
            version: 0,
        }
    }

    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = key_fn;
        self.custom_key_fn = true;
        self
    }

    pub fn with_resume_mode(mut self, mode: ResumeMode) -> Self {
        self.resume_mode = mode;
        self
    }

    fn bump(&mut self) {
        self.version += 1;
    }

    /// The connection opened. Returns the statement to send, if any.
    pub fn connection_opened(&mut self) -> Option<Issue> {
        if self.state == ReducerState::Closed {
            return None;
        }
        self.connected = true;
        if self.state == ReducerState::Errored {
            return None;
        }
        self.issue()
    }

    fn issue(&mut self) -> Option<Issue> {
        let (request, resume_from) = match (self.issued, self.watermark) {
            (true, Some(watermark)) => (self.request.resume_from(watermark), Some(watermark)),
            _ => (self.request.clone(), None),
        };

        let statement = match request.statement() {
            Ok(statement) => statement,
            Err(e) => {
                self.latch(ProtocolError::with_code(e.to_string(), "invalid_request"));
                return None;
            }
        };

        if self.issued && self.resume_mode == ResumeMode::Rebuild {
            self.staged = Some(BTreeMap::new());
        }
        self.start_at = request.start_at();
        self.issued = true;
        self.state = if self.snapshot_complete {
            ReducerState::Streaming
        } else {
            ReducerState::AwaitingSnapshot
        };
        self.bump();

        debug!(
            resume_from = ?resume_from,
            start_at = ?self.start_at,
            "Issuing subscribe statement"
        );
        Some(Issue {
            statement,
            resume_from,
        })
    }

    pub fn connection_closed(&mut self) {
        self.connected = false;
        self.staged = None;
        if self.state.is_folding() {
            self.state = ReducerState::AwaitingConnection;
            self.bump();
        }
    }

    fn latch(&mut self, error: ProtocolError) {
        warn!(error = %error, code = ?error.code, "Subscription errored");
        self.error = Some(error);
        self.staged = None;
        self.state = ReducerState::Errored;
        self.bump();
    }

    pub fn apply(&mut self, frame: &Frame) -> FoldOutcome {
        if !self.state.is_folding() {
            return FoldOutcome::Ignored;
        }

        match frame {
            Frame::Data(data) => {
                let key = (self.key_fn)(&data.row);
                let set = match self.staged.as_mut() {
                    Some(staged) => staged,
                    None => &mut self.live,
                };
                match data.op {
                    UpsertOp::Upsert => {
                        set.insert(key, data.row.clone());
                    }
                    UpsertOp::Delete => {
                        set.remove(&key);
                    }
                }
                self.bump();
                FoldOutcome::Applied
            }
            Frame::Progress { timestamp } => {
                if let Some(watermark) = self.watermark {
                    if *timestamp < watermark {
                        warn!(
                            watermark = %watermark,
                            progress = %timestamp,
                            "Ignoring regressed progress frame"
                        );
                        return FoldOutcome::Ignored;
                    }
                }
                self.watermark = Some(*timestamp);

                let mut completed = false;
                if self.start_at.map_or(true, |start| *timestamp >= start) {
                    if let Some(staged) = self.staged.take() {
                        debug!(rows = staged.len(), "Swapping in rebuilt snapshot");
                        self.live = staged;
                    }
                    if !self.snapshot_complete {
                        self.snapshot_complete = true;
                        completed = true;
                        debug!(watermark = %timestamp, rows = self.live.len(), "Snapshot complete");
                    }
                    self.state = ReducerState::Streaming;
                }
                self.bump();
                FoldOutcome::Progress { completed }
            }
            Frame::Error(error) => {
                self.latch(error.clone());
                FoldOutcome::Errored(error.clone())
            }
        }
    }

    /// Clear everything derived from the stream.
    ///
    /// Returns true when a session is open. That session still streams the
    /// old statement, so it must be replaced; frames are ignored until the
    /// next [`connection_opened`](Self::connection_opened) issues afresh.
    pub fn reset(&mut self) -> bool {
        if self.state == ReducerState::Closed {
            return false;
        }
        self.live.clear();
        self.staged = None;
        self.watermark = None;
        self.start_at = None;
        self.snapshot_complete = false;
        self.error = None;
        self.issued = false;
        self.state = ReducerState::AwaitingConnection;
        self.bump();

        std::mem::replace(&mut self.connected, false)
    }

    /// Swap the request and [`reset`](Self::reset).
    pub fn replace_request(&mut self, request: SubscribeRequest) -> bool {
        if self.state == ReducerState::Closed {
            return false;
        }
        if !self.custom_key_fn {
            self.key_fn = default_key_fn(request.upsert_key());
        }
        self.request = request;
        self.reset()
    }

    pub fn close(&mut self) {
        if self.state != ReducerState::Closed {
            self.state = ReducerState::Closed;
            self.staged = None;
            self.connected = false;
            self.bump();
        }
    }

    pub fn request(&self) -> &SubscribeRequest {
        &self.request
    }

    pub fn state(&self) -> ReducerState {
        self.state
    }

    pub fn watermark(&self) -> Option<Timestamp> {
        self.watermark
    }

    pub fn snapshot_complete(&self) -> bool {
        self.snapshot_complete
    }

    pub fn error(&self) -> Option<&ProtocolError> {
        self.error.as_ref()
    }

    /// Incremented on every observable change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Live rows, ordered by key.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.live.values()
    }

    pub fn get(&self, key: &str) -> Option<&Row> {
        self.live.get(key)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl std::fmt::Debug for StreamReducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReducer")
            .field("query", &self.request.query())
            .field("state", &self.state)
            .field("rows", &self.live.len())
            .field("watermark", &self.watermark)
            .field("snapshot_complete", &self.snapshot_complete)
            .finish_non_exhaustive()
    }
}
