//! Live subscriptions: a [`StreamReducer`] wired to a transport and a
//! [`ConnectionManager`].
//!
//! ## Wiring
//!
//! ```text
//!  FrameTransport ──on_open──▶ reducer.connection_opened() ──▶ send(statement)
//!                 ──on_close─▶ reducer.connection_closed()
//!                 ──on_frame─▶ reducer.apply(frame)
//!
//!  reset / replace_request ──▶ manager.reconnect() ──▶ fresh statement on open
//!
//!  ConnectionManager: owns reconnect/backoff for the same transport
//! ```
//!
//! Every observable change bumps a version published on a `watch` channel;
//! [`Subscription::updates`] lets a caller await the next change and then
//! read [`Subscription::snapshot`].
//!
//! ## Examples
//!
//! ```ignore
//! let subscription = Subscription::builder()
//!     .request(SubscribeRequest::new("SELECT id, name FROM users", "id")?)
//!     .transport(Arc::new(WebSocketTarget::new(WebSocketConfig::default())?))
//!     .health(Arc::new(HealthBoard::healthy("localhost:6876")))
//!     .select(|row| row.to_json_object())
//!     .build()?;
//!
//! let mut updates = subscription.updates();
//! while updates.changed().await.is_ok() {
//!     let snapshot = subscription.snapshot();
//!     if snapshot.snapshot_complete {
//!         println!("{} rows", snapshot.data.len());
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use livefeed_core::{Frame, ProtocolError, Row, SubscribeRequest, Timestamp};
use livefeed_observability::metrics::{
    FRAMES_TOTAL, LIVE_ROWS, PROTOCOL_ERRORS_TOTAL, SNAPSHOTS_COMPLETED_TOTAL,
    STATEMENTS_SENT_TOTAL, SUBSCRIPTIONS_ACTIVE,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::lifecycle::{ConnectionManager, ManagerConfig, ReconnectionState};
use crate::listeners::Unsubscribe;
use crate::reducer::{FoldOutcome, Issue, KeyFn, ReducerState, ResumeMode, StreamReducer};
use crate::target::{ConnectionTarget, FrameTransport, HealthSignal};

/// What a subscription currently shows.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot<R> {
    /// Live rows after folding, ordered by key.
    pub data: Vec<R>,
    /// Latched protocol error, cleared by `reset`.
    pub error: Option<ProtocolError>,
    /// True once a progress watermark at or after the start point was seen.
    pub snapshot_complete: bool,
}

type SelectFn<R> = Arc<dyn Fn(&Row) -> R + Send + Sync>;

struct SubShared {
    reducer: Mutex<StreamReducer>,
    transport: Arc<dyn FrameTransport>,
    manager: Mutex<Option<Arc<ConnectionManager>>>,
    hooks: Mutex<Vec<Unsubscribe>>,
    close_on_complete: bool,
    updates: watch::Sender<u64>,
    /// This subscription's share of the `LIVE_ROWS` gauge.
    live_rows: AtomicI64,
}

impl SubShared {
    fn publish(&self) {
        let (version, len) = {
            let reducer = self.reducer.lock();
            let len = if reducer.state() == ReducerState::Closed {
                0
            } else {
                reducer.len()
            };
            (reducer.version(), len)
        };
        self.track_rows(len);
        self.updates.send_replace(version);
    }

    fn track_rows(&self, len: usize) {
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let previous = self.live_rows.swap(len, Ordering::Relaxed);
        LIVE_ROWS.add(len - previous);
    }

    fn send(&self, issue: Issue) {
        let mode = if issue.resume_from.is_some() {
            "resume"
        } else {
            "initial"
        };
        match self.transport.send(&issue.statement) {
            Ok(()) => {
                STATEMENTS_SENT_TOTAL.with_label_values(&[mode]).inc();
                debug!(mode, resume_from = ?issue.resume_from, "Subscribe statement sent");
            }
            // The connection manager owns recovery; the next open re-issues.
            Err(e) => warn!(error = %e, mode, "Failed to send subscribe statement"),
        }
    }

    fn handle_open(&self) {
        let issue = self.reducer.lock().connection_opened();
        self.publish();
        if let Some(issue) = issue {
            self.send(issue);
        }
    }

    fn handle_close(&self) {
        self.reducer.lock().connection_closed();
        self.publish();
    }

    fn handle_frame(&self, frame: &Frame) {
        FRAMES_TOTAL.with_label_values(&[frame.kind()]).inc();

        let outcome = self.reducer.lock().apply(frame);
        match &outcome {
            FoldOutcome::Ignored => return,
            FoldOutcome::Errored(_) => PROTOCOL_ERRORS_TOTAL.inc(),
            FoldOutcome::Progress { completed: true } => SNAPSHOTS_COMPLETED_TOTAL.inc(),
            _ => {}
        }
        self.publish();

        if outcome == (FoldOutcome::Progress { completed: true }) && self.close_on_complete {
            info!("Snapshot complete, closing subscription");
            self.disconnect();
        }
    }

    fn disconnect(&self) {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        drop(hooks);

        let was_open = {
            let mut reducer = self.reducer.lock();
            let was_open = reducer.state() != ReducerState::Closed;
            reducer.close();
            was_open
        };

        let manager = self.manager.lock().take();
        if let Some(manager) = manager {
            manager.destroy();
        }

        if was_open {
            SUBSCRIPTIONS_ACTIVE.dec();
            debug!("Subscription closed");
            self.publish();
        }
    }

    fn restart(&self, replace_session: bool) {
        self.publish();
        if !replace_session {
            return;
        }
        let manager = self.manager.lock().clone();
        if let Some(manager) = manager {
            debug!("Replacing session for a fresh statement");
            manager.reconnect();
        }
    }
}

/// A live `SUBSCRIBE` whose result set is kept up to date across reconnects.
///
/// Created with [`Subscription::builder`]. Dropping the subscription
/// disconnects it.
pub struct Subscription<R = Row> {
    shared: Arc<SubShared>,
    select: SelectFn<R>,
}

impl Subscription<Row> {
    pub fn builder() -> SubscriptionBuilder<Row> {
        SubscriptionBuilder::new()
    }
}

impl<R> Subscription<R> {
    /// Current rows (projected through `select`), error and completion flag.
    pub fn snapshot(&self) -> SubscriptionSnapshot<R> {
        let (rows, error, snapshot_complete) = {
            let reducer = self.shared.reducer.lock();
            (
                reducer.rows().cloned().collect::<Vec<Row>>(),
                reducer.error().cloned(),
                reducer.snapshot_complete(),
            )
        };
        SubscriptionSnapshot {
            data: rows.iter().map(|row| (self.select)(row)).collect(),
            error,
            snapshot_complete,
        }
    }

    /// Clear the live set, watermark and any latched error. Connectivity is
    /// kept: an open session is replaced, and the new one gets a fresh
    /// statement.
    pub fn reset(&self) {
        let replace = self.shared.reducer.lock().reset();
        self.shared.restart(replace);
    }

    /// Subscribe to a different query. Frames still in flight for the old
    /// query never reach the new live set.
    pub fn replace_request(&self, request: SubscribeRequest) {
        let replace = self.shared.reducer.lock().replace_request(request);
        self.shared.restart(replace);
    }

    /// Stop the subscription: unsubscribe from the transport, destroy the
    /// connection manager and freeze the snapshot. Idempotent.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Version counter bumped on every observable change.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.shared.updates.subscribe()
    }

    pub fn state(&self) -> ReducerState {
        self.shared.reducer.lock().state()
    }

    pub fn watermark(&self) -> Option<Timestamp> {
        self.shared.reducer.lock().watermark()
    }

    pub fn request(&self) -> SubscribeRequest {
        self.shared.reducer.lock().request().clone()
    }

    /// Reconnection state, or `None` once disconnected.
    pub fn connection(&self) -> Option<ReconnectionState> {
        self.manager().map(|m| m.state())
    }

    pub fn connection_watch(&self) -> Option<watch::Receiver<ReconnectionState>> {
        self.manager().map(|m| m.watch())
    }

    /// Manual reconnect, for a connection that gave up.
    pub fn retry_now(&self) {
        if let Some(manager) = self.manager() {
            manager.retry_now();
        }
    }

    fn manager(&self) -> Option<Arc<ConnectionManager>> {
        self.shared.manager.lock().clone()
    }
}

impl<R> Drop for Subscription<R> {
    fn drop(&mut self) {
        self.shared.disconnect();
    }
}

impl<R> std::fmt::Debug for Subscription<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("reducer", &*self.shared.reducer.lock())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Subscription`].
///
/// `request`, `transport` and `health` are required.
pub struct SubscriptionBuilder<R = Row> {
    request: Option<SubscribeRequest>,
    transport: Option<(Arc<dyn FrameTransport>, Arc<dyn ConnectionTarget>)>,
    health: Option<Arc<dyn HealthSignal>>,
    manager_config: ManagerConfig,
    key_fn: Option<KeyFn>,
    select: SelectFn<R>,
    close_on_complete: bool,
    resume_mode: ResumeMode,
}

impl SubscriptionBuilder<Row> {
    pub fn new() -> Self {
        Self {
            request: None,
            transport: None,
            health: None,
            manager_config: ManagerConfig::default(),
            key_fn: None,
            select: Arc::new(|row: &Row| row.clone()),
            close_on_complete: false,
            resume_mode: ResumeMode::default(),
        }
    }
}

impl Default for SubscriptionBuilder<Row> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> SubscriptionBuilder<R> {
    pub fn request(mut self, request: SubscribeRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn transport<T: FrameTransport + 'static>(mut self, transport: Arc<T>) -> Self {
        let frames: Arc<dyn FrameTransport> = transport.clone();
        let target: Arc<dyn ConnectionTarget> = transport;
        self.transport = Some((frames, target));
        self
    }

    pub fn health<H: HealthSignal + 'static>(mut self, health: Arc<H>) -> Self {
        let health: Arc<dyn HealthSignal> = health;
        self.health = Some(health);
        self
    }

    pub fn manager_config(mut self, config: ManagerConfig) -> Self {
        self.manager_config = config;
        self
    }

    /// Override the key derived from the request's upsert key.
    pub fn key_fn(mut self, key_fn: impl Fn(&Row) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Project each live row when a snapshot is read.
    pub fn select<S>(
        self,
        select: impl Fn(&Row) -> S + Send + Sync + 'static,
    ) -> SubscriptionBuilder<S> {
        SubscriptionBuilder {
            request: self.request,
            transport: self.transport,
            health: self.health,
            manager_config: self.manager_config,
            key_fn: self.key_fn,
            select: Arc::new(select),
            close_on_complete: self.close_on_complete,
            resume_mode: self.resume_mode,
        }
    }

    /// Disconnect once the first complete snapshot has been folded.
    pub fn close_on_complete(mut self, enabled: bool) -> Self {
        self.close_on_complete = enabled;
        self
    }

    pub fn resume_mode(mut self, mode: ResumeMode) -> Self {
        self.resume_mode = mode;
        self
    }

    /// Register with the transport and start connecting.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<Subscription<R>> {
        let request = self
            .request
            .ok_or_else(|| ClientError::ConfigError("request is required".to_string()))?;
        let (transport, target) = self
            .transport
            .ok_or_else(|| ClientError::ConfigError("transport is required".to_string()))?;
        let health = self
            .health
            .ok_or_else(|| ClientError::ConfigError("health signal is required".to_string()))?;

        let mut reducer = StreamReducer::new(request).with_resume_mode(self.resume_mode);
        if let Some(key_fn) = self.key_fn {
            reducer = reducer.with_key_fn(key_fn);
        }
        let (updates, _) = watch::channel(reducer.version());

        let shared = Arc::new(SubShared {
            reducer: Mutex::new(reducer),
            transport: Arc::clone(&transport),
            manager: Mutex::new(None),
            hooks: Mutex::new(Vec::new()),
            close_on_complete: self.close_on_complete,
            updates,
            live_rows: AtomicI64::new(0),
        });
        SUBSCRIPTIONS_ACTIVE.inc();

        let hooks = vec![
            transport.on_open(Box::new(with_shared(&shared, |s| s.handle_open()))),
            transport.on_close(Box::new(with_shared(&shared, |s| s.handle_close()))),
            transport.on_frame(Box::new({
                let weak = Arc::downgrade(&shared);
                move |frame: &Frame| {
                    if let Some(shared) = weak.upgrade() {
                        shared.handle_frame(frame);
                    }
                }
            })),
        ];
        shared.hooks.lock().extend(hooks);

        let already_open = transport.is_connected();
        let manager = match ConnectionManager::new(target, health, self.manager_config) {
            Ok(manager) => Arc::new(manager),
            Err(e) => {
                shared.disconnect();
                return Err(e);
            }
        };
        *shared.manager.lock() = Some(manager);

        if already_open {
            shared.handle_open();
        }

        // close_on_complete may have fired before the manager was stored.
        if shared.reducer.lock().state() == ReducerState::Closed {
            shared.disconnect();
        }

        info!(
            query = %shared.reducer.lock().request().query(),
            "Subscription started"
        );

        Ok(Subscription {
            shared,
            select: self.select,
        })
    }
}

fn with_shared(
    shared: &Arc<SubShared>,
    f: impl Fn(&SubShared) + Send + Sync + 'static,
) -> impl Fn() + Send + Sync + 'static {
    let weak: Weak<SubShared> = Arc::downgrade(shared);
    move || {
        if let Some(shared) = weak.upgrade() {
            f(&shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthBoard;
    use crate::testing::MockTransport;

    fn request() -> SubscribeRequest {
        SubscribeRequest::new("SELECT id, v FROM t", "id").unwrap()
    }

    #[test]
    fn test_build_requires_fields() {
        let err = Subscription::builder().build().unwrap_err();
        assert!(matches!(err, ClientError::ConfigError(ref m) if m.contains("request")));

        let err = Subscription::builder()
            .request(request())
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::ConfigError(ref m) if m.contains("transport")));

        let err = Subscription::builder()
            .request(request())
            .transport(Arc::new(MockTransport::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::ConfigError(ref m) if m.contains("health")));
    }

    #[test]
    fn test_build_outside_runtime_releases_hooks() {
        let transport = Arc::new(MockTransport::new());
        let err = Subscription::builder()
            .request(request())
            .transport(Arc::clone(&transport))
            .health(Arc::new(HealthBoard::healthy("db:6876")))
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::NoRuntime));
        assert_eq!(transport.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_already_open_transport_gets_statement() {
        let transport = Arc::new(MockTransport::new());
        transport.emit_open();

        let subscription = Subscription::builder()
            .request(request())
            .transport(Arc::clone(&transport))
            .health(Arc::new(HealthBoard::healthy("db:6876")))
            .build()
            .unwrap();

        assert_eq!(transport.sent().len(), 1);
        assert!(transport.reconnects().is_empty());
        assert_eq!(subscription.state(), ReducerState::AwaitingSnapshot);
    }
}
