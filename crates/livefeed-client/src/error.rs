//! Error types for livefeed client operations.
//!
//! ## Error Handling Strategy
//!
//! - **Configuration errors** (`Core`, `ConfigError`, `NoRuntime`): fail fast
//!   while a subscription or manager is being built.
//! - **Transport errors** (`NotConnected`, `Transport`): never surface on a
//!   subscription snapshot. The connection manager's retry policy absorbs
//!   them; only exhausted retries become visible, as `ConnectionStatus::Failed`.
//! - **Protocol errors** are not part of this enum. They are latched into the
//!   snapshot as [`livefeed_core::ProtocolError`] because they describe the
//!   request, not the call that observed them.
//!
//! ## Examples
//!
//! ```ignore
//! use livefeed_client::{ClientError, Subscription};
//!
//! match Subscription::builder().build() {
//!     Err(ClientError::ConfigError(msg)) => eprintln!("bad config: {}", msg),
//!     Err(e) => eprintln!("Error: {}", e),
//!     Ok(sub) => { /* ... */ }
//! }
//! ```

use thiserror::Error;

/// Convenience type alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The request failed validation (empty query, missing upsert key, ...).
    #[error("Invalid request: {0}")]
    Core(#[from] livefeed_core::Error),

    /// Invalid builder configuration.
    ///
    /// ## Causes
    /// - Required fields missing (request, transport, health)
    /// - Invalid parameter values (e.g. an unparsable address)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A retry timer needs a Tokio runtime, and none was running on the
    /// thread that built the connection manager.
    #[error("No Tokio runtime available; build connection managers inside a runtime")]
    NoRuntime,

    /// A send was attempted while the target had no open connection.
    #[error("Not connected")]
    NotConnected,

    /// The transport failed to carry a message.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serializing an outbound wire message failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
