use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Connection Lifecycle Metrics
    // ============================================================================

    /// Connection attempts issued to a target (initial, health-triggered and retries)
    pub static ref CONNECT_ATTEMPTS_TOTAL: IntCounter = IntCounter::new(
        "livefeed_connect_attempts_total",
        "Total connection attempts issued"
    ).expect("metric can be created");

    /// Retry timers scheduled after a close
    pub static ref RETRIES_SCHEDULED_TOTAL: IntCounter = IntCounter::new(
        "livefeed_retries_scheduled_total",
        "Total reconnection retries scheduled"
    ).expect("metric can be created");

    /// Times a manager gave up after max_attempts
    pub static ref RETRIES_EXHAUSTED_TOTAL: IntCounter = IntCounter::new(
        "livefeed_retries_exhausted_total",
        "Total times reconnection attempts were exhausted"
    ).expect("metric can be created");

    /// Open and close notifications observed from targets
    pub static ref CONNECTION_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("livefeed_connection_events_total", "Total open/close notifications from targets"),
        &["event"] // open, close
    ).expect("metric can be created");

    /// Connections currently open across all managers
    pub static ref CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "livefeed_connections_active",
        "Number of open subscription connections"
    ).expect("metric can be created");

    // ============================================================================
    // Stream Metrics
    // ============================================================================

    /// Frames received, by kind (upsert, delete, progress, error)
    pub static ref FRAMES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("livefeed_frames_total", "Total frames received"),
        &["kind"]
    ).expect("metric can be created");

    /// Protocol errors latched into a subscription
    pub static ref PROTOCOL_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "livefeed_protocol_errors_total",
        "Total protocol errors latched by subscriptions"
    ).expect("metric can be created");

    /// Subscriptions whose initial snapshot completed
    pub static ref SNAPSHOTS_COMPLETED_TOTAL: IntCounter = IntCounter::new(
        "livefeed_snapshots_completed_total",
        "Total subscriptions that reached a complete snapshot"
    ).expect("metric can be created");

    /// Statements sent (first issuance and resumptions)
    pub static ref STATEMENTS_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("livefeed_statements_sent_total", "Total SUBSCRIBE statements sent"),
        &["mode"] // initial, resume
    ).expect("metric can be created");

    /// Rows held in live snapshots across all subscriptions
    pub static ref LIVE_ROWS: IntGauge = IntGauge::new(
        "livefeed_live_rows",
        "Number of rows held in live snapshots"
    ).expect("metric can be created");

    /// Live subscriptions
    pub static ref SUBSCRIPTIONS_ACTIVE: IntGauge = IntGauge::new(
        "livefeed_subscriptions_active",
        "Number of live subscriptions"
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(CONNECT_ATTEMPTS_TOTAL.clone()))
            .expect("connect_attempts_total can be registered");
        REGISTRY
            .register(Box::new(RETRIES_SCHEDULED_TOTAL.clone()))
            .expect("retries_scheduled_total can be registered");
        REGISTRY
            .register(Box::new(RETRIES_EXHAUSTED_TOTAL.clone()))
            .expect("retries_exhausted_total can be registered");
        REGISTRY
            .register(Box::new(CONNECTION_EVENTS_TOTAL.clone()))
            .expect("connection_events_total can be registered");
        REGISTRY
            .register(Box::new(CONNECTIONS_ACTIVE.clone()))
            .expect("connections_active can be registered");

        REGISTRY
            .register(Box::new(FRAMES_TOTAL.clone()))
            .expect("frames_total can be registered");
        REGISTRY
            .register(Box::new(PROTOCOL_ERRORS_TOTAL.clone()))
            .expect("protocol_errors_total can be registered");
        REGISTRY
            .register(Box::new(SNAPSHOTS_COMPLETED_TOTAL.clone()))
            .expect("snapshots_completed_total can be registered");
        REGISTRY
            .register(Box::new(STATEMENTS_SENT_TOTAL.clone()))
            .expect("statements_sent_total can be registered");
        REGISTRY
            .register(Box::new(LIVE_ROWS.clone()))
            .expect("live_rows can be registered");
        REGISTRY
            .register(Box::new(SUBSCRIPTIONS_ACTIVE.clone()))
            .expect("subscriptions_active can be registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        init();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"livefeed_connect_attempts_total".to_string()));
    }

    #[test]
    fn test_frame_counters_by_kind() {
        let before = FRAMES_TOTAL.with_label_values(&["progress"]).get();
        FRAMES_TOTAL.with_label_values(&["progress"]).inc();
        FRAMES_TOTAL.with_label_values(&["progress"]).inc();
        assert_eq!(
            FRAMES_TOTAL.with_label_values(&["progress"]).get(),
            before + 2
        );
    }

    #[test]
    fn test_statement_counters() {
        let before = STATEMENTS_SENT_TOTAL.with_label_values(&["resume"]).get();
        STATEMENTS_SENT_TOTAL.with_label_values(&["resume"]).inc();
        assert_eq!(
            STATEMENTS_SENT_TOTAL.with_label_values(&["resume"]).get(),
            before + 1
        );
    }
}
