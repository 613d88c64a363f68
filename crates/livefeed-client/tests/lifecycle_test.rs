//! Integration tests for the connection lifecycle manager.
//!
//! Time is paused: `tokio::time::sleep` in a test auto-advances the clock,
//! firing any retry timer due before the sleep ends.

use std::sync::Arc;
use std::time::Duration;

use livefeed_client::testing::MockTransport;
use livefeed_client::{
    ConnectionManager, ConnectionParams, ConnectionStatus, ConnectionTarget, FixedJitter,
    HealthBoard, HealthSnapshot, ManagerConfig,
};

const ADDRESS: &str = "db:6876";

fn config(max_attempts: u32) -> ManagerConfig {
    ManagerConfig::default()
        .max_attempts(max_attempts)
        .base_delay(Duration::from_millis(1000))
        .max_delay(Duration::from_millis(30_000))
        .jitter(FixedJitter(0.0))
}

fn setup(
    health: HealthSnapshot,
    config: ManagerConfig,
) -> (Arc<MockTransport>, Arc<HealthBoard>, ConnectionManager) {
    let transport = Arc::new(MockTransport::new());
    let board = Arc::new(HealthBoard::new(health));
    let manager = ConnectionManager::new(transport.clone(), board.clone(), config).unwrap();
    (transport, board, manager)
}

#[tokio::test(start_paused = true)]
async fn test_close_schedules_exactly_one_retry() {
    let (transport, _board, manager) = setup(HealthSnapshot::healthy(ADDRESS), config(3));
    assert_eq!(transport.reconnects(), vec![ADDRESS.to_string()]);

    transport.emit_open();
    assert_eq!(manager.state().status, ConnectionStatus::Connected);

    transport.emit_close();
    let state = manager.state();
    assert_eq!(state.status, ConnectionStatus::Reconnecting);
    assert_eq!(state.next_retry, Some(Duration::from_millis(1000)));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(transport.reconnects().len(), 2);

    // No further close, no further attempt.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.reconnects().len(), 2);
    assert_eq!(manager.state().attempt, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_close_does_not_retry() {
    let (transport, board, manager) = setup(HealthSnapshot::healthy(ADDRESS), config(3));
    transport.emit_open();

    board.set_healthy(false);
    assert_eq!(manager.state().status, ConnectionStatus::Connected);
    assert_eq!(transport.disconnects(), 0);

    transport.emit_close();
    assert_eq!(manager.state().status, ConnectionStatus::Disconnected);

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(transport.reconnects().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_when_unhealthy() {
    let (transport, board, manager) = setup(
        HealthSnapshot::healthy(ADDRESS),
        config(3).disconnect_when_unhealthy(true),
    );
    transport.emit_open();

    board.set_healthy(false);
    assert_eq!(transport.disconnects(), 1);
    assert_eq!(manager.state().status, ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_health_before_connecting() {
    let (transport, board, manager) = setup(
        HealthSnapshot::unhealthy(Some(ADDRESS.to_string())),
        config(3),
    );
    assert!(transport.reconnects().is_empty());
    assert_eq!(manager.state().status, ConnectionStatus::Disconnected);

    board.set_healthy(true);
    assert_eq!(transport.reconnects(), vec![ADDRESS.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_then_fails() {
    let (transport, board, manager) = setup(HealthSnapshot::healthy(ADDRESS), config(2));

    transport.emit_close();
    assert_eq!(manager.state().next_retry_ms(), Some(1000));
    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert_eq!(transport.reconnects().len(), 2);

    transport.emit_close();
    assert_eq!(manager.state().next_retry_ms(), Some(2000));
    tokio::time::sleep(Duration::from_millis(1999)).await;
    assert_eq!(transport.reconnects().len(), 2);
    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(transport.reconnects().len(), 3);

    transport.emit_close();
    let state = manager.state();
    assert_eq!(state.status, ConnectionStatus::Failed);
    assert_eq!(state.attempt, 2);
    assert_eq!(state.next_retry, None);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.reconnects().len(), 3);

    // Only a health transition starts over.
    board.set_healthy(false);
    board.set_healthy(true);
    assert_eq!(transport.reconnects().len(), 4);
    assert_eq!(manager.state().attempt, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_now_after_failure() {
    let (transport, _board, manager) = setup(HealthSnapshot::healthy(ADDRESS), config(0));
    transport.emit_close();
    assert_eq!(manager.state().status, ConnectionStatus::Failed);

    manager.retry_now();
    assert_eq!(transport.reconnects().len(), 2);
    assert_eq!(manager.state().status, ConnectionStatus::Reconnecting);

    transport.emit_open();
    assert_eq!(manager.state().status, ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_jitter_applies_to_scheduled_delay() {
    let (transport, _board, manager) = setup(
        HealthSnapshot::healthy(ADDRESS),
        config(3).jitter(FixedJitter(1.0)),
    );
    transport.emit_close();
    assert_eq!(manager.state().next_retry_ms(), Some(1250));
}

#[tokio::test(start_paused = true)]
async fn test_address_change_reconnects() {
    let (transport, board, _manager) = setup(HealthSnapshot::healthy(ADDRESS), config(3));
    transport.emit_open();

    board.set_address(Some("replica:6876".to_string()));
    assert_eq!(
        transport.reconnects(),
        vec![ADDRESS.to_string(), "replica:6876".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_replacement_is_not_interrupted() {
    let (transport, board, manager) = setup(HealthSnapshot::healthy(ADDRESS), config(3));
    transport.emit_open();

    // The old session's close is reported from inside reconnect.
    board.set_address(Some("replica:6876".to_string()));
    let state = manager.state();
    assert_eq!(state.status, ConnectionStatus::Reconnecting);
    assert_eq!(state.next_retry, None);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.reconnects().len(), 2);

    transport.emit_open();
    assert_eq!(manager.state().status, ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_cycles_open_session() {
    let (transport, _board, manager) = setup(HealthSnapshot::healthy(ADDRESS), config(3));
    manager.reconnect();
    assert_eq!(transport.reconnects().len(), 1);

    transport.emit_open();
    manager.reconnect();
    assert_eq!(transport.reconnects().len(), 2);
    assert!(!transport.is_connected());
    assert_eq!(manager.state().next_retry, None);

    transport.emit_open();
    assert_eq!(manager.state().status, ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_connection_params_are_passed_through() {
    let params = ConnectionParams::new().user("materialize").password("secret");
    let (transport, _board, _manager) = setup(
        HealthSnapshot::healthy(ADDRESS),
        config(3).connection_params(params.clone()),
    );
    assert_eq!(transport.last_params(), Some(params));
}

#[tokio::test(start_paused = true)]
async fn test_destroy_is_idempotent() {
    let (transport, board, manager) = setup(HealthSnapshot::healthy(ADDRESS), config(3));
    transport.emit_open();
    transport.emit_close();
    assert_eq!(manager.state().status, ConnectionStatus::Reconnecting);

    manager.destroy();
    manager.destroy();
    assert_eq!(transport.disconnects(), 1);
    assert_eq!(transport.listener_count(), 0);
    assert_eq!(board.subscriber_count(), 0);
    assert_eq!(manager.state().status, ConnectionStatus::Disconnected);

    // The pending retry was cancelled, and later events reach nobody.
    tokio::time::sleep(Duration::from_secs(10)).await;
    transport.emit_open();
    transport.emit_close();
    board.set_healthy(false);
    board.set_healthy(true);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.reconnects().len(), 1);

    drop(manager);
    assert_eq!(transport.disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_drop_disconnects() {
    let (transport, board, manager) = setup(HealthSnapshot::healthy(ADDRESS), config(3));
    drop(manager);
    assert_eq!(transport.disconnects(), 1);
    assert_eq!(transport.listener_count(), 0);
    assert_eq!(board.subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_synchronous_open_from_reconnect() {
    let transport = Arc::new(MockTransport::auto_open());
    let board = Arc::new(HealthBoard::healthy(ADDRESS));
    let manager = ConnectionManager::new(transport.clone(), board, config(3)).unwrap();
    assert_eq!(manager.state().status, ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_watch_observes_transitions() {
    let (transport, _board, manager) = setup(HealthSnapshot::healthy(ADDRESS), config(3));
    let mut status = manager.watch();
    status.borrow_and_update();

    transport.emit_open();
    assert!(status.has_changed().unwrap());
    assert_eq!(status.borrow_and_update().status, ConnectionStatus::Connected);

    transport.emit_close();
    assert_eq!(status.borrow_and_update().status, ConnectionStatus::Reconnecting);
}
