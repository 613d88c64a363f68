//! WebSocket [`FrameTransport`] speaking the SQL-over-WebSocket protocol.
//!
//! Each `reconnect` starts a new session task:
//!
//! 1. Open `ws[s]://<address>/api/experimental/sql` within `connect_timeout`.
//! 2. Send the [`AuthMessage`] built from the connection parameters.
//! 3. Wait for the first `ReadyForQuery`; the target is now open.
//! 4. Forward queued statements out and decoded [`Frame`]s in until either
//!    side closes.
//!
//! Sessions are numbered. Only the current session may report open, close or
//! frames, so a replaced session that is still winding down stays silent.
//! A session that ends for any reason (failed connect, timeout, server close,
//! I/O error) reports a close; retrying is the connection manager's job.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use livefeed_core::Frame;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::decoder::{AuthMessage, QueryMessage, SubscribeDecoder, WebSocketResponse};
use crate::error::{ClientError, Result};
use crate::listeners::{Listeners, Unsubscribe};
use crate::target::{
    CloseCallback, ConnectionParams, ConnectionTarget, FrameCallback, FrameTransport, OpenCallback,
};

pub const DEFAULT_SQL_PATH: &str = "/api/experimental/sql";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Bound on TCP connect, TLS handshake and HTTP upgrade (default: 10s)
    pub connect_timeout: Duration,
    /// Endpoint path used when the address does not carry one
    pub path: String,
    /// Use `wss://` for bare `host:port` addresses
    pub secure: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            path: DEFAULT_SQL_PATH.to_string(),
            secure: false,
        }
    }
}

/// Build the socket URL for `address`.
///
/// Accepts `ws://`, `wss://`, `http://`, `https://` and bare `host:port`
/// forms. The configured path is applied unless the address has one.
///
/// # Examples
///
/// ```ignore
/// let config = WebSocketConfig::default();
/// assert_eq!(
///     websocket_url("localhost:6876", &config)?.as_str(),
///     "ws://localhost:6876/api/experimental/sql"
/// );
/// ```
pub fn websocket_url(address: &str, config: &WebSocketConfig) -> Result<Url> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ClientError::ConfigError("address is empty".to_string()));
    }

    let with_scheme = if let Some(rest) = address.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = address.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if address.starts_with("ws://") || address.starts_with("wss://") {
        address.to_string()
    } else if config.secure {
        format!("wss://{address}")
    } else {
        format!("ws://{address}")
    };

    let mut url = Url::parse(&with_scheme)
        .map_err(|e| ClientError::ConfigError(format!("invalid address {address:?}: {e}")))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ClientError::ConfigError(format!(
            "invalid address {address:?}: missing host"
        )));
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(&config.path);
    }
    Ok(url)
}

struct Session {
    generation: u64,
    open: bool,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

struct WsInner {
    config: WebSocketConfig,
    runtime: Handle,
    address: Mutex<Option<String>>,
    params: Mutex<Option<ConnectionParams>>,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    connected: AtomicBool,
    opens: Listeners<()>,
    closes: Listeners<()>,
    frames: Listeners<Frame>,
}

impl WsInner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn session_opened(&self, generation: u64) {
        let opened = {
            let mut session = self.session.lock();
            match session.as_mut() {
                Some(s) if s.generation == generation => {
                    s.open = true;
                    self.connected.store(true, Ordering::SeqCst);
                    true
                }
                _ => false,
            }
        };
        if opened {
            info!(generation, "WebSocket session open");
            self.opens.emit(&());
        }
    }

    fn session_ended(&self, generation: u64) {
        let ended = {
            let mut session = self.session.lock();
            match session.as_ref() {
                Some(s) if s.generation == generation => session.take(),
                _ => None,
            }
        };
        if ended.is_some() {
            self.connected.store(false, Ordering::SeqCst);
            debug!(generation, "WebSocket session ended");
            self.closes.emit(&());
        }
    }

    fn auth_message(&self) -> AuthMessage {
        match self.params.lock().as_ref() {
            Some(params) => AuthMessage {
                user: params.user.clone(),
                password: params.password.clone(),
                options: params.options.clone(),
            },
            None => AuthMessage::default(),
        }
    }
}

/// A reconnectable WebSocket connection to one SQL endpoint.
///
/// Must be created inside a Tokio runtime; session tasks are spawned onto it
/// even when `reconnect` is called from another thread.
pub struct WebSocketTarget {
    inner: Arc<WsInner>,
}

impl WebSocketTarget {
    pub fn new(config: WebSocketConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        Ok(Self {
            inner: Arc::new(WsInner {
                config,
                runtime,
                address: Mutex::new(None),
                params: Mutex::new(None),
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                opens: Listeners::new(),
                closes: Listeners::new(),
                frames: Listeners::new(),
            }),
        })
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.inner.config
    }
}

impl ConnectionTarget for WebSocketTarget {
    fn reconnect(&self, address: Option<&str>, params: Option<&ConnectionParams>) {
        if let Some(address) = address {
            *self.inner.address.lock() = Some(address.to_string());
        }
        if let Some(params) = params {
            *self.inner.params.lock() = Some(params.clone());
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.inner.session.lock().take();
        let previous_open = match previous {
            Some(session) => {
                session.task.abort();
                session.open
            }
            None => false,
        };
        if previous_open {
            self.inner.connected.store(false, Ordering::SeqCst);
            self.inner.closes.emit(&());
        }

        let url = self
            .inner
            .address
            .lock()
            .clone()
            .ok_or_else(|| ClientError::ConfigError("no address to connect to".to_string()))
            .and_then(|address| websocket_url(&address, &self.inner.config));
        let url = match url {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Cannot connect");
                self.inner.closes.emit(&());
                return;
            }
        };

        let auth = self.inner.auth_message();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        // Held across the spawn so the task cannot report an end before the
        // session is registered.
        let mut session = self.inner.session.lock();
        let task = self.inner.runtime.spawn(run_session(
            Arc::downgrade(&self.inner),
            generation,
            url,
            auth,
            self.inner.config.connect_timeout,
            outbound_rx,
        ));
        *session = Some(Session {
            generation,
            open: false,
            outbound: outbound_tx,
            task,
        });
    }

    fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            session.task.abort();
            self.inner.connected.store(false, Ordering::SeqCst);
            debug!(generation = session.generation, "WebSocket disconnected");
            self.inner.closes.emit(&());
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn on_open(&self, callback: OpenCallback) -> Unsubscribe {
        self.inner.opens.register(move |_| callback())
    }

    fn on_close(&self, callback: CloseCallback) -> Unsubscribe {
        self.inner.closes.register(move |_| callback())
    }
}

impl FrameTransport for WebSocketTarget {
    fn send(&self, statement: &str) -> Result<()> {
        let text = serde_json::to_string(&QueryMessage {
            query: statement.to_string(),
        })?;
        let session = self.inner.session.lock();
        match session.as_ref() {
            Some(s) if s.open => s
                .outbound
                .send(text)
                .map_err(|_| ClientError::NotConnected),
            _ => Err(ClientError::NotConnected),
        }
    }

    fn on_frame(&self, callback: FrameCallback) -> Unsubscribe {
        self.inner.frames.register(move |frame| callback(frame))
    }
}

impl Drop for WebSocketTarget {
    fn drop(&mut self) {
        if let Some(session) = self.inner.session.lock().take() {
            session.task.abort();
        }
    }
}

async fn run_session(
    inner: Weak<WsInner>,
    generation: u64,
    url: Url,
    auth: AuthMessage,
    connect_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    debug!(url = %url, generation, "Connecting WebSocket");

    let stream = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            warn!(url = %url, error = %e, "WebSocket connect failed");
            end_session(&inner, generation);
            return;
        }
        Err(_) => {
            warn!(
                url = %url,
                timeout_ms = connect_timeout.as_millis() as u64,
                "WebSocket connect timed out"
            );
            end_session(&inner, generation);
            return;
        }
    };
    let (mut sink, mut source) = stream.split();

    let auth_result = match serde_json::to_string(&auth) {
        Ok(text) => sink.send(Message::Text(text)).await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    if let Err(e) = auth_result {
        warn!(error = %e, "Failed to send WebSocket auth message");
        end_session(&inner, generation);
        return;
    }

    let mut decoder = SubscribeDecoder::new();
    let mut ready = false;

    loop {
        tokio::select! {
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "WebSocket send failed");
                    break;
                }
            }
            message = source.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(frame = ?frame, "Server closed WebSocket");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket read failed");
                        break;
                    }
                    None => break,
                };

                let Some(shared) = inner.upgrade() else { return };
                if !shared.is_current(generation) {
                    return;
                }

                if !ready {
                    match serde_json::from_str::<WebSocketResponse>(&text) {
                        Ok(WebSocketResponse::ReadyForQuery(_)) => {
                            ready = true;
                            shared.session_opened(generation);
                        }
                        Ok(WebSocketResponse::Error(notice)) => {
                            warn!(message = %notice.message, code = ?notice.code, "WebSocket session rejected");
                            break;
                        }
                        _ => {}
                    }
                    continue;
                }

                if let Some(frame) = decoder.decode_text(&text) {
                    shared.frames.emit(&frame);
                }
            }
        }
    }

    end_session(&inner, generation);
}

fn end_session(inner: &Weak<WsInner>, generation: u64) {
    if let Some(inner) = inner.upgrade() {
        inner.session_ended(generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(address: &str) -> String {
        websocket_url(address, &WebSocketConfig::default())
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_url_normalisation() {
        assert_eq!(url("localhost:6876"), "ws://localhost:6876/api/experimental/sql");
        assert_eq!(url("http://localhost:6876"), "ws://localhost:6876/api/experimental/sql");
        assert_eq!(url("https://mz.example.com"), "wss://mz.example.com/api/experimental/sql");
        assert_eq!(url("wss://mz.example.com/custom"), "wss://mz.example.com/custom");
        assert_eq!(url("  localhost:6876 "), "ws://localhost:6876/api/experimental/sql");
    }

    #[test]
    fn test_secure_bare_address() {
        let config = WebSocketConfig {
            secure: true,
            ..WebSocketConfig::default()
        };
        assert_eq!(
            websocket_url("mz.example.com:443", &config).unwrap().as_str(),
            "wss://mz.example.com/api/experimental/sql"
        );
    }

    #[test]
    fn test_invalid_addresses() {
        let config = WebSocketConfig::default();
        assert!(matches!(
            websocket_url("", &config),
            Err(ClientError::ConfigError(_))
        ));
        assert!(matches!(
            websocket_url("ws://", &config),
            Err(ClientError::ConfigError(_))
        ));
    }

    #[test]
    fn test_new_requires_runtime() {
        assert!(matches!(
            WebSocketTarget::new(WebSocketConfig::default()),
            Err(ClientError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_send_without_session_fails() {
        let target = WebSocketTarget::new(WebSocketConfig::default()).unwrap();
        assert!(!target.is_connected());
        assert!(matches!(target.send("SELECT 1"), Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_unreachable_address_reports_close() {
        let target = WebSocketTarget::new(WebSocketConfig {
            connect_timeout: Duration::from_millis(500),
            ..WebSocketConfig::default()
        })
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = target.on_close(Box::new(move || {
            let _ = tx.send(());
        }));

        // Port 9 (discard) on localhost is closed in test environments.
        target.reconnect(Some("127.0.0.1:9"), None);
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("close reported")
            .expect("channel open");
        assert!(!target.is_connected());
    }

    #[tokio::test]
    async fn test_invalid_address_reports_close_immediately() {
        let target = WebSocketTarget::new(WebSocketConfig::default()).unwrap();
        let closes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = Arc::clone(&closes);
        let _handle = target.on_close(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        target.reconnect(Some("ws://"), None);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
