//! Tracing setup shared by livefeed binaries.
//!
//! Libraries in this workspace only emit `tracing` events; installing a
//! subscriber is left to the process that owns stdout.

use tracing_subscriber::{fmt, util::TryInitError, EnvFilter};

/// Install a global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` (e.g. `"info"` or
/// `"livefeed_client=debug,info"`) is used. Returns an error if a global
/// subscriber is already installed.
pub fn init_tracing(default_filter: &str) -> Result<(), TryInitError> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
}
