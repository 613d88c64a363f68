//! In-memory test doubles.
//!
//! [`MockTransport`] records every call the manager and subscription make and
//! lets a test drive open/close/frame events by hand, synchronously.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use livefeed_core::Frame;
use parking_lot::Mutex;

use crate::error::{ClientError, Result};
use crate::listeners::{Listeners, Unsubscribe};
use crate::target::{
    CloseCallback, ConnectionParams, ConnectionTarget, FrameCallback, FrameTransport, OpenCallback,
};

#[derive(Default)]
pub struct MockTransport {
    connected: AtomicBool,
    open_on_reconnect: AtomicBool,
    fail_sends: AtomicBool,
    reconnects: Mutex<Vec<String>>,
    params: Mutex<Vec<Option<ConnectionParams>>>,
    disconnects: AtomicUsize,
    sent: Mutex<Vec<String>>,
    opens: Listeners<()>,
    closes: Listeners<()>,
    frames: Listeners<Frame>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that reports open synchronously from inside `reconnect`.
    pub fn auto_open() -> Self {
        let transport = Self::default();
        transport.open_on_reconnect.store(true, Ordering::SeqCst);
        transport
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn emit_open(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.opens.emit(&());
    }

    pub fn emit_close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closes.emit(&());
    }

    pub fn emit_frame(&self, frame: Frame) {
        self.frames.emit(&frame);
    }

    pub fn emit_frames(&self, frames: impl IntoIterator<Item = Frame>) {
        for frame in frames {
            self.emit_frame(frame);
        }
    }

    /// Addresses passed to `reconnect`, in call order. A call without an
    /// address records an empty string.
    pub fn reconnects(&self) -> Vec<String> {
        self.reconnects.lock().clone()
    }

    pub fn last_params(&self) -> Option<ConnectionParams> {
        self.params.lock().last().cloned().flatten()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Callbacks currently registered, across open, close and frame.
    pub fn listener_count(&self) -> usize {
        self.opens.len() + self.closes.len() + self.frames.len()
    }
}

impl ConnectionTarget for MockTransport {
    fn reconnect(&self, address: Option<&str>, params: Option<&ConnectionParams>) {
        self.reconnects
            .lock()
            .push(address.unwrap_or_default().to_string());
        self.params.lock().push(params.cloned());
        if self.connected.swap(false, Ordering::SeqCst) {
            self.closes.emit(&());
        }
        if self.open_on_reconnect.load(Ordering::SeqCst) {
            self.emit_open();
        }
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            self.closes.emit(&());
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn on_open(&self, callback: OpenCallback) -> Unsubscribe {
        self.opens.register(move |_| callback())
    }

    fn on_close(&self, callback: CloseCallback) -> Unsubscribe {
        self.closes.register(move |_| callback())
    }
}

impl FrameTransport for MockTransport {
    fn send(&self, statement: &str) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("injected send failure".to_string()));
        }
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.sent.lock().push(statement.to_string());
        Ok(())
    }

    fn on_frame(&self, callback: FrameCallback) -> Unsubscribe {
        self.frames.register(move |frame| callback(frame))
    }
}
