//! Follow a query's live result set
//!
//! ## Examples
//!
//! ```bash
//! # Print the table every time it changes
//! livefeed subscribe "SELECT id, total FROM orders" --key id
//!
//! # One complete snapshot as JSON, then exit
//! livefeed subscribe "SELECT * FROM inventory" -k warehouse -k sku --once -f json
//!
//! # Resume from a known logical timestamp
//! livefeed subscribe "SELECT * FROM orders" -k id --as-of-at-least 1700000000000
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use livefeed_client::{
    ConnectionParams, HealthBoard, ManagerConfig, ReconnectionState, ReducerState, ResumeMode,
    Subscription, SubscriptionSnapshot, WebSocketConfig, WebSocketTarget,
};
use livefeed_core::{Row, SubscribeRequest, Timestamp};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{Config, OutputFormat};
use crate::format::Formatter;

#[derive(Args, Debug)]
pub struct SubscribeArgs {
    /// Query whose result set to follow
    pub query: String,

    /// Upsert key column (repeat for a composite key)
    #[arg(short, long = "key", required = true)]
    pub keys: Vec<String>,

    /// Database address (host:port or ws/http URL)
    #[arg(short, long, env = "LIVEFEED_ADDR")]
    pub address: Option<String>,

    /// Login user
    #[arg(short, long, env = "LIVEFEED_USER")]
    pub user: Option<String>,

    /// Login password
    #[arg(long, env = "LIVEFEED_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Session option sent with the login (KEY=VALUE, repeatable)
    #[arg(short = 'o', long = "option", value_parser = parse_key_value)]
    pub options: Vec<(String, String)>,

    /// Use TLS for a bare host:port address
    #[arg(long)]
    pub secure: bool,

    /// Start no earlier than this logical timestamp (ms since epoch)
    #[arg(long)]
    pub as_of_at_least: Option<u64>,

    /// Exit after the first complete snapshot
    #[arg(long)]
    pub once: bool,

    /// After a reconnect, rebuild the result set instead of replaying into it
    #[arg(long)]
    pub rebuild_on_reconnect: bool,

    /// Output format (default: from config)
    #[arg(short, long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Serve Prometheus metrics on this address while subscribed
    #[arg(long, env = "LIVEFEED_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

impl SubscribeArgs {
    fn request(&self) -> Result<SubscribeRequest> {
        let mut request = SubscribeRequest::new(self.query.clone(), self.keys.clone())
            .context("Invalid subscription")?;
        if let Some(ms) = self.as_of_at_least {
            request = request.as_of_at_least(Timestamp::from_millis(ms));
        }
        Ok(request)
    }

    fn connection_params(&self, config: &Config) -> ConnectionParams {
        let mut params = ConnectionParams::new();
        if let Some(user) = self.user.as_ref().or(config.user.as_ref()) {
            params = params.user(user.clone());
        }
        if let Some(password) = &self.password {
            params = params.password(password.clone());
        }
        for (key, value) in &self.options {
            params = params.option(key.clone(), value.clone());
        }
        params
    }

    fn manager_config(&self, config: &Config) -> ManagerConfig {
        ManagerConfig::default()
            .max_attempts(config.max_attempts)
            .base_delay(Duration::from_millis(config.base_delay_ms))
            .max_delay(Duration::from_millis(config.max_delay_ms))
            .connection_params(self.connection_params(config))
    }
}

/// Run `livefeed subscribe` until Ctrl-C, a protocol error or (with
/// `--once`) the first complete snapshot.
pub async fn run(args: SubscribeArgs, config: &Config, colored: bool) -> Result<()> {
    let formatter = Formatter::new(args.format.unwrap_or(config.output_format), colored);
    let address = args.address.clone().unwrap_or_else(|| config.address.clone());

    if let Some(addr) = args.metrics_addr {
        serve_metrics(addr).await?;
        formatter.print_info(&format!("Metrics on http://{}/metrics", addr));
    }

    let transport = Arc::new(WebSocketTarget::new(WebSocketConfig {
        secure: args.secure || config.secure,
        ..WebSocketConfig::default()
    })?);
    let health = Arc::new(HealthBoard::healthy(address.clone()));
    let resume_mode = if args.rebuild_on_reconnect {
        ResumeMode::Rebuild
    } else {
        ResumeMode::Replay
    };

    let subscription = Subscription::builder()
        .request(args.request()?)
        .transport(transport)
        .health(health)
        .manager_config(args.manager_config(config))
        .resume_mode(resume_mode)
        .close_on_complete(args.once)
        .build()
        .context("Failed to start subscription")?;

    info!(address = %address, "Subscribing");
    formatter.print_info(&format!("Subscribing via {}", address));

    let mut updates = subscription.updates();
    let mut status = subscription.connection_watch();
    let mut printed: Option<Vec<Row>> = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                debug!("Interrupted");
                break;
            }
            Some(state) = next_status(&mut status) => {
                formatter.print_status(&state);
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = subscription.snapshot();
                if let Some(error) = &snapshot.error {
                    formatter.print_protocol_error(error);
                    bail!("Subscription failed: {}", error);
                }
                if should_print(&snapshot, printed.as_deref()) {
                    formatter.print_snapshot(&snapshot, subscription.watermark())?;
                    printed = Some(snapshot.data);
                }
                if subscription.state() == ReducerState::Closed {
                    break;
                }
            }
        }
    }

    subscription.disconnect();
    Ok(())
}

/// Print complete snapshots only, and only when the rows changed.
fn should_print(snapshot: &SubscriptionSnapshot<Row>, printed: Option<&[Row]>) -> bool {
    snapshot.snapshot_complete && printed != Some(snapshot.data.as_slice())
}

/// Next connection state; pending forever once the manager is gone.
async fn next_status(
    rx: &mut Option<watch::Receiver<ReconnectionState>>,
) -> Option<ReconnectionState> {
    let Some(inner) = rx.as_mut() else {
        return std::future::pending().await;
    };
    if inner.changed().await.is_ok() {
        return Some(inner.borrow_and_update().clone());
    }
    *rx = None;
    None
}

async fn serve_metrics(addr: SocketAddr) -> Result<()> {
    livefeed_observability::init_metrics();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics address {}", addr))?;

    tokio::spawn(async move {
        let app = livefeed_observability::exporter::create_metrics_router();
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "Metrics server stopped");
        }
    });
    Ok(())
}
