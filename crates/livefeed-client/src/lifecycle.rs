//! Connection Lifecycle Manager
//!
//! Keeps one long-lived duplex connection alive across flaky networks and
//! backend restarts, without hammering an endpoint that is known to be down.
//!
//! ## Design
//!
//! ```text
//!   HealthSignal ──changes──┐        ┌──open/close── ConnectionTarget
//!                           ▼        ▼
//!                      ┌──────────────────┐
//!                      │  LifecycleCore   │  pure state machine
//!                      └────────┬─────────┘
//!                   actions     │     retry schedule
//!            (connect, disconnect)     (epoch, delay)
//!                      ┌────────▼─────────┐
//!                      │ ConnectionManager│  tokio timer + watch channel
//!                      └──────────────────┘
//! ```
//!
//! Every event (health change, open, close, timer fire) runs one transition
//! of [`LifecycleCore`] under a mutex. The transition returns the calls to
//! make on the target; they run after the mutex is released, so a target may
//! fire `on_open`/`on_close` synchronously from `reconnect` or `disconnect`.
//!
//! ## Retry rules
//!
//! - Automatic retries happen only while health is available (enabled and
//!   healthy with a known address).
//! - Each close while available schedules one timer, using
//!   [`BackoffPolicy::delay_for`] with the current attempt count.
//! - `max_attempts` consecutive failures move the status to
//!   [`ConnectionStatus::Failed`]. Only a health transition or
//!   [`ConnectionManager::retry_now`] starts over.
//! - Timer tasks carry an epoch; a firing whose epoch is no longer current is
//!   ignored.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use livefeed_observability::metrics::{
    CONNECTIONS_ACTIVE, CONNECTION_EVENTS_TOTAL, CONNECT_ATTEMPTS_TOTAL, RETRIES_EXHAUSTED_TOTAL,
    RETRIES_SCHEDULED_TOTAL,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffPolicy, JitterSource, RandomJitter};
use crate::error::{ClientError, Result};
use crate::listeners::Unsubscribe;
use crate::target::{ConnectionParams, ConnectionTarget, HealthSignal, HealthSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published view of a manager's reconnection progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionState {
    pub status: ConnectionStatus,
    /// Consecutive failed attempts since the last successful open.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Delay of the pending retry timer, if one is scheduled.
    pub next_retry: Option<Duration>,
}

impl ReconnectionState {
    pub fn next_retry_ms(&self) -> Option<u64> {
        self.next_retry.map(|d| d.as_millis() as u64)
    }
}

/// Configuration for a [`ConnectionManager`].
///
/// # Examples
///
/// ```ignore
/// let config = ManagerConfig::default()
///     .max_attempts(3)
///     .base_delay(Duration::from_millis(500))
///     .jitter(FixedJitter(0.0));
/// ```
#[derive(Clone)]
pub struct ManagerConfig {
    pub backoff: BackoffPolicy,
    /// Passed to every `reconnect` call.
    pub connection_params: Option<ConnectionParams>,
    pub jitter: Arc<dyn JitterSource>,
    /// Close an open connection when health turns unavailable. Off by
    /// default: the open connection keeps streaming until it drops by itself.
    pub disconnect_when_unhealthy: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            connection_params: None,
            jitter: Arc::new(RandomJitter),
            disconnect_when_unhealthy: false,
        }
    }
}

impl fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("backoff", &self.backoff)
            .field("connection_params", &self.connection_params.is_some())
            .field("disconnect_when_unhealthy", &self.disconnect_when_unhealthy)
            .finish_non_exhaustive()
    }
}

impl ManagerConfig {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.backoff.max_attempts = max_attempts;
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.backoff.base_delay = base_delay;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.backoff.max_delay = max_delay;
        self
    }

    pub fn connection_params(mut self, params: ConnectionParams) -> Self {
        self.connection_params = Some(params);
        self
    }

    pub fn jitter(mut self, jitter: impl JitterSource + 'static) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    pub fn disconnect_when_unhealthy(mut self, enabled: bool) -> Self {
        self.disconnect_when_unhealthy = enabled;
        self
    }
}

/// A call to make on the target once the state lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    Connect { address: String },
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRetry {
    epoch: u64,
    delay: Duration,
}

/// The reconnection state machine, free of I/O and timers.
#[derive(Debug)]
pub(crate) struct LifecycleCore {
    policy: BackoffPolicy,
    disconnect_when_unhealthy: bool,
    health: HealthSnapshot,
    attempt: u32,
    connected: bool,
    in_flight: bool,
    exhausted: bool,
    retry: Option<PendingRetry>,
    epoch: u64,
    destroyed: bool,
}

impl LifecycleCore {
    pub(crate) fn new(
        policy: BackoffPolicy,
        disconnect_when_unhealthy: bool,
        health: HealthSnapshot,
        connected: bool,
    ) -> Self {
        Self {
            policy,
            disconnect_when_unhealthy,
            health,
            attempt: 0,
            connected,
            in_flight: false,
            exhausted: false,
            retry: None,
            epoch: 0,
            destroyed: false,
        }
    }

    fn available_address(&self) -> Option<&str> {
        if self.health.is_available() {
            self.health.address.as_deref()
        } else {
            None
        }
    }

    fn cancel_retry(&mut self) {
        self.retry = None;
    }

    fn start_over(&mut self) {
        self.cancel_retry();
        self.attempt = 0;
        self.exhausted = false;
        self.in_flight = false;
    }

    /// Initial connection attempt, made once at construction.
    pub(crate) fn start(&mut self) -> Vec<Action> {
        if self.destroyed || self.connected {
            return Vec::new();
        }
        match self.available_address() {
            Some(address) => vec![Action::Connect {
                address: address.to_string(),
            }],
            None => {
                debug!(health = ?self.health, "Endpoint unavailable, not connecting");
                Vec::new()
            }
        }
    }

    pub(crate) fn health_changed(&mut self, health: HealthSnapshot) -> Vec<Action> {
        if self.destroyed {
            return Vec::new();
        }

        let was_available = self.health.is_available();
        let address_changed = self.health.address != health.address;
        self.health = health;

        if !self.health.is_available() {
            if !was_available {
                return Vec::new();
            }
            info!(health = ?self.health, "Endpoint became unavailable");
            self.start_over();
            if self.disconnect_when_unhealthy && self.connected {
                return vec![Action::Disconnect];
            }
            return Vec::new();
        }

        if was_available && !address_changed {
            return Vec::new();
        }

        self.start_over();
        let Some(address) = self.health.address.clone() else {
            return Vec::new();
        };

        if self.connected && !address_changed {
            return Vec::new();
        }
        // The close for the session being replaced must not schedule a retry.
        self.in_flight = self.connected;

        info!(
            address = %address,
            address_changed,
            "Endpoint available, connecting"
        );
        vec![Action::Connect { address }]
    }

    pub(crate) fn opened(&mut self) -> Vec<Action> {
        if self.destroyed {
            return Vec::new();
        }
        if self.attempt > 0 {
            info!(attempt = self.attempt, "Reconnected");
        }
        self.connected = true;
        self.start_over();
        Vec::new()
    }

    /// `unit_jitter` is consumed only if a retry gets scheduled.
    pub(crate) fn closed(&mut self, unit_jitter: f64) -> Vec<Action> {
        if self.destroyed {
            return Vec::new();
        }
        let replaced = self.connected && self.in_flight;
        self.connected = false;
        if replaced {
            debug!("Replaced session closed, new attempt in flight");
            return Vec::new();
        }
        self.in_flight = false;

        if !self.health.is_available() {
            debug!("Connection closed while endpoint unavailable, not retrying");
            return Vec::new();
        }
        if self.retry.is_some() {
            return Vec::new();
        }

        if self.policy.is_exhausted(self.attempt) {
            if !self.exhausted {
                warn!(
                    attempt = self.attempt,
                    max_attempts = self.policy.max_attempts,
                    "Reconnection attempts exhausted, giving up"
                );
            }
            self.exhausted = true;
            return Vec::new();
        }

        let delay = self.policy.delay_for(self.attempt, unit_jitter);
        self.epoch += 1;
        self.retry = Some(PendingRetry {
            epoch: self.epoch,
            delay,
        });
        debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Connection closed, retry scheduled"
        );
        Vec::new()
    }

    pub(crate) fn retry_fired(&mut self, epoch: u64) -> Vec<Action> {
        if self.destroyed {
            return Vec::new();
        }
        match self.retry {
            Some(pending) if pending.epoch == epoch => {}
            _ => return Vec::new(),
        }

        self.retry = None;
        self.attempt += 1;

        if self.connected {
            return Vec::new();
        }
        match self.health.address.clone() {
            Some(address) => {
                debug!(attempt = self.attempt, address = %address, "Retrying connection");
                self.in_flight = true;
                vec![Action::Connect { address }]
            }
            None => Vec::new(),
        }
    }

    /// Manual retry: start the attempt count over and connect right away.
    pub(crate) fn retry_now(&mut self) -> Vec<Action> {
        if self.destroyed || self.connected {
            return Vec::new();
        }
        let Some(address) = self.available_address().map(str::to_string) else {
            return Vec::new();
        };
        self.start_over();
        self.in_flight = true;
        info!(address = %address, "Manual reconnect requested");
        vec![Action::Connect { address }]
    }

    /// Replace the open session with a new one to the same address.
    ///
    /// Without an available address the session is only closed.
    pub(crate) fn reconnect(&mut self) -> Vec<Action> {
        if self.destroyed || !self.connected {
            return Vec::new();
        }
        let Some(address) = self.available_address().map(str::to_string) else {
            return vec![Action::Disconnect];
        };
        self.start_over();
        self.in_flight = true;
        debug!(address = %address, "Replacing open session");
        vec![Action::Connect { address }]
    }

    pub(crate) fn destroy(&mut self) -> Vec<Action> {
        if self.destroyed {
            return Vec::new();
        }
        self.destroyed = true;
        self.cancel_retry();
        self.in_flight = false;
        self.connected = false;
        vec![Action::Disconnect]
    }

    fn pending_retry(&self) -> Option<PendingRetry> {
        self.retry
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        if self.connected {
            ConnectionStatus::Connected
        } else if self.retry.is_some() || self.in_flight {
            ConnectionStatus::Reconnecting
        } else if self.exhausted {
            ConnectionStatus::Failed
        } else {
            ConnectionStatus::Disconnected
        }
    }

    pub(crate) fn state(&self) -> ReconnectionState {
        ReconnectionState {
            status: self.status(),
            attempt: self.attempt,
            max_attempts: self.policy.max_attempts,
            next_retry: self.retry.map(|r| r.delay),
        }
    }
}

struct RetryTimer {
    epoch: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    core: LifecycleCore,
    timer: Option<RetryTimer>,
}

struct Shared {
    inner: Mutex<Inner>,
    target: Arc<dyn ConnectionTarget>,
    health: Arc<dyn HealthSignal>,
    jitter: Arc<dyn JitterSource>,
    params: Option<ConnectionParams>,
    runtime: Handle,
    status_tx: watch::Sender<ReconnectionState>,
    subscriptions: Mutex<Vec<Unsubscribe>>,
}

impl Shared {
    fn transition(self: &Arc<Self>, f: impl FnOnce(&mut LifecycleCore) -> Vec<Action>) {
        let actions = {
            let mut inner = self.inner.lock();
            let before = inner.core.status();
            let actions = f(&mut inner.core);
            self.reconcile_timer(&mut inner);

            let state = inner.core.state();
            record_status_change(before, state.status);
            self.status_tx.send_replace(state);
            actions
        };

        for action in actions {
            self.perform(action);
        }
    }

    /// Make the running timer task match the core's pending retry.
    fn reconcile_timer(self: &Arc<Self>, inner: &mut Inner) {
        let wanted = inner.core.pending_retry();
        let current = inner.timer.as_ref().map(|t| t.epoch);
        if wanted.map(|p| p.epoch) == current {
            return;
        }

        if let Some(timer) = inner.timer.take() {
            timer.handle.abort();
        }

        if let Some(PendingRetry { epoch, delay }) = wanted {
            RETRIES_SCHEDULED_TOTAL.inc();
            let weak: Weak<Shared> = Arc::downgrade(self);
            let handle = self.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(shared) = weak.upgrade() {
                    shared.transition(|core| core.retry_fired(epoch));
                }
            });
            inner.timer = Some(RetryTimer { epoch, handle });
        }
    }

    fn perform(&self, action: Action) {
        match action {
            Action::Connect { address } => {
                CONNECT_ATTEMPTS_TOTAL.inc();
                debug!(address = %address, "Connecting");
                self.target.reconnect(Some(&address), self.params.as_ref());
            }
            Action::Disconnect => {
                debug!("Disconnecting");
                self.target.disconnect();
            }
        }
    }
}

fn record_status_change(before: ConnectionStatus, after: ConnectionStatus) {
    if before == after {
        return;
    }
    if after == ConnectionStatus::Connected {
        CONNECTIONS_ACTIVE.inc();
    } else if before == ConnectionStatus::Connected {
        CONNECTIONS_ACTIVE.dec();
    }
    if after == ConnectionStatus::Failed {
        RETRIES_EXHAUSTED_TOTAL.inc();
    }
    debug!(from = %before, to = %after, "Connection status changed");
}

/// Drives one [`ConnectionTarget`] according to a [`HealthSignal`] and a
/// [`BackoffPolicy`].
///
/// The manager subscribes to the target and the health signal on
/// construction and tries to connect right away when health allows. It owns
/// those subscriptions and the retry timer; [`destroy`](Self::destroy) (or
/// dropping the manager) releases all of them and disconnects the target.
///
/// # Thread Safety
///
/// `ConnectionManager` is `Send + Sync`. Callbacks from the target and the
/// health signal may arrive on any thread.
///
/// # Examples
///
/// ```ignore
/// let board = Arc::new(HealthBoard::healthy("localhost:6876"));
/// let target = Arc::new(WebSocketTarget::new(WebSocketConfig::default()));
/// let manager = ConnectionManager::new(target, board, ManagerConfig::default())?;
///
/// let mut status = manager.watch();
/// while status.changed().await.is_ok() {
///     println!("{}", status.borrow().status);
/// }
/// ```
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Fails with [`ClientError::NoRuntime`] outside a Tokio runtime.
    pub fn new(
        target: Arc<dyn ConnectionTarget>,
        health: Arc<dyn HealthSignal>,
        config: ManagerConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        livefeed_observability::init_metrics();

        let core = LifecycleCore::new(
            config.backoff,
            config.disconnect_when_unhealthy,
            health.current(),
            target.is_connected(),
        );
        if core.status() == ConnectionStatus::Connected {
            CONNECTIONS_ACTIVE.inc();
        }
        let (status_tx, _) = watch::channel(core.state());

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner { core, timer: None }),
            target,
            health,
            jitter: config.jitter,
            params: config.connection_params,
            runtime,
            status_tx,
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&shared);
        let on_open = shared.target.on_open(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                CONNECTION_EVENTS_TOTAL.with_label_values(&["open"]).inc();
                shared.transition(|core| core.opened());
            }
        }));

        let weak = Arc::downgrade(&shared);
        let on_close = shared.target.on_close(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                CONNECTION_EVENTS_TOTAL.with_label_values(&["close"]).inc();
                let unit_jitter = shared.jitter.sample();
                shared.transition(|core| core.closed(unit_jitter));
            }
        }));

        let weak = Arc::downgrade(&shared);
        let on_health = shared.health.subscribe(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                let snapshot = shared.health.current();
                shared.transition(|core| core.health_changed(snapshot));
            }
        }));

        shared
            .subscriptions
            .lock()
            .extend([on_open, on_close, on_health]);

        shared.transition(|core| core.start());

        Ok(Self { shared })
    }

    pub fn state(&self) -> ReconnectionState {
        self.shared.inner.lock().core.state()
    }

    /// Receiver that observes every published [`ReconnectionState`].
    pub fn watch(&self) -> watch::Receiver<ReconnectionState> {
        self.shared.status_tx.subscribe()
    }

    /// Connect now, with a fresh attempt budget, if health allows.
    pub fn retry_now(&self) {
        self.shared.transition(|core| core.retry_now());
    }

    /// Close the open session and connect a new one. Does nothing while
    /// disconnected; the next open starts a fresh session anyway.
    pub fn reconnect(&self) {
        self.shared.transition(|core| core.reconnect());
    }

    /// Cancel the retry timer, drop the target and health subscriptions and
    /// disconnect the target. Calling it again does nothing.
    pub fn destroy(&self) {
        let subscriptions = std::mem::take(&mut *self.shared.subscriptions.lock());
        drop(subscriptions);
        self.shared.transition(|core| core.destroy());
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
