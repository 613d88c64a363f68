//! livefeed Observability
//!
//! Provides metrics and logging setup for livefeed.
//!
//! # Features
//!
//! - Prometheus metrics for connection lifecycle and stream folding
//! - `/metrics` router for embedding in an HTTP server
//! - Structured logging with tracing
//!
//! # Usage
//!
//! ```no_run
//! use livefeed_observability::{exporter, logging, metrics};
//!
//! logging::init_tracing("info").ok();
//! metrics::init();
//!
//! let metrics_router = exporter::create_metrics_router();
//! ```

pub mod exporter;
pub mod logging;
pub mod metrics;

pub use logging::init_tracing;
pub use metrics::{init as init_metrics, REGISTRY};

/// Initialize all observability components that are safe to initialize
/// from a library. Tracing is left to the binary.
pub fn init() {
    metrics::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_does_not_panic() {
        init();
    }

    #[test]
    fn test_double_init_is_safe() {
        init();
        init();
        let _registry = &*REGISTRY;
    }
}
