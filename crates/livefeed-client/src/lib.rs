//! livefeed Client - Live SUBSCRIBE result sets over flaky connections
//!
//! This crate keeps the result of a streaming `SUBSCRIBE` query up to date in
//! memory. It handles health-gated reconnection with jittered exponential
//! backoff, resumption from the last progress watermark, and folding of the
//! upsert-envelope change feed into a keyed snapshot.
//!
//! # Components
//!
//! - [`ConnectionManager`]: reconnection policy for one [`ConnectionTarget`]
//! - [`StreamReducer`]: pure fold of [`Frame`](livefeed_core::Frame)s into a live set
//! - [`Subscription`]: the two wired to a [`FrameTransport`]
//! - [`WebSocketTarget`]: transport for the SQL-over-WebSocket endpoint
//! - [`HealthBoard`]: in-process [`HealthSignal`]
//!
//! # Examples
//!
//! ```ignore
//! use livefeed_client::{HealthBoard, Subscription, WebSocketConfig, WebSocketTarget};
//! use livefeed_core::SubscribeRequest;
//!
//! let health = Arc::new(HealthBoard::healthy("localhost:6876"));
//! let transport = Arc::new(WebSocketTarget::new(WebSocketConfig::default())?);
//!
//! let subscription = Subscription::builder()
//!     .request(SubscribeRequest::new("SELECT id, total FROM orders", "id")?)
//!     .transport(transport)
//!     .health(health.clone())
//!     .build()?;
//!
//! // Later: the endpoint went away; the manager stops retrying until it is back.
//! health.set_healthy(false);
//! ```

pub mod backoff;
pub mod decoder;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod listeners;
pub mod reducer;
pub mod subscription;
pub mod target;
pub mod testing;
pub mod websocket;

pub use backoff::{BackoffPolicy, FixedJitter, JitterSource, RandomJitter, SeededJitter};
pub use decoder::{SubscribeDecoder, WebSocketResponse};
pub use error::{ClientError, Result};
pub use health::HealthBoard;
pub use lifecycle::{ConnectionManager, ConnectionStatus, ManagerConfig, ReconnectionState};
pub use listeners::{Listeners, Unsubscribe};
pub use reducer::{default_key_fn, FoldOutcome, KeyFn, ReducerState, ResumeMode, StreamReducer};
pub use subscription::{Subscription, SubscriptionBuilder, SubscriptionSnapshot};
pub use target::{ConnectionParams, ConnectionTarget, FrameTransport, HealthSignal, HealthSnapshot};
pub use websocket::{websocket_url, WebSocketConfig, WebSocketTarget};
