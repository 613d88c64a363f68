//! Capability traits at the transport and health seams.
//!
//! The connection manager never creates a connection. It drives one that the
//! transport layer hands it, through [`ConnectionTarget`], and it learns
//! whether the endpoint is worth connecting to through [`HealthSignal`].
//! Subscriptions additionally need to send statements and receive frames,
//! which is what [`FrameTransport`] adds.
//!
//! Every `on_*`/`subscribe` registration returns an owned [`Unsubscribe`].
//! Implementations may invoke callbacks synchronously from inside
//! `reconnect`, `send` or `disconnect`; callers must not hold locks across
//! those calls.

use std::collections::BTreeMap;

use livefeed_core::Frame;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::listeners::Unsubscribe;

pub type OpenCallback = Box<dyn Fn() + Send + Sync>;
pub type CloseCallback = Box<dyn Fn() + Send + Sync>;
pub type FrameCallback = Box<dyn Fn(&Frame) + Send + Sync>;
pub type HealthCallback = Box<dyn Fn() + Send + Sync>;

/// Opaque connection parameters passed through to the transport.
///
/// Credentials are never inspected by the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Session options, e.g. `cluster` or `search_path`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl ConnectionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// One long-lived duplex connection, owned by the transport layer.
pub trait ConnectionTarget: Send + Sync {
    /// (Re)open the connection. `address` overrides the target's last known
    /// address when given.
    ///
    /// An open session is closed first, and its close is reported before
    /// `reconnect` returns.
    fn reconnect(&self, address: Option<&str>, params: Option<&ConnectionParams>);

    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn on_open(&self, callback: OpenCallback) -> Unsubscribe;

    fn on_close(&self, callback: CloseCallback) -> Unsubscribe;
}

/// A [`ConnectionTarget`] that carries statements out and frames in.
pub trait FrameTransport: ConnectionTarget {
    /// Send one statement on the open connection.
    ///
    /// Fails with [`ClientError::NotConnected`](crate::ClientError::NotConnected)
    /// when no connection is open.
    fn send(&self, statement: &str) -> Result<()>;

    fn on_frame(&self, callback: FrameCallback) -> Unsubscribe;
}

/// Point-in-time view of an endpoint's health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub enabled: bool,
    pub healthy: bool,
    pub address: Option<String>,
}

impl HealthSnapshot {
    pub fn healthy(address: impl Into<String>) -> Self {
        Self {
            enabled: true,
            healthy: true,
            address: Some(address.into()),
        }
    }

    pub fn unhealthy(address: Option<String>) -> Self {
        Self {
            enabled: true,
            healthy: false,
            address,
        }
    }

    /// Connecting is only worthwhile when the endpoint is enabled, healthy
    /// and has a known address.
    pub fn is_available(&self) -> bool {
        self.enabled && self.healthy && self.address.as_deref().is_some_and(|a| !a.is_empty())
    }
}

/// Observable health of the endpoint, owned outside this crate.
pub trait HealthSignal: Send + Sync {
    /// Register for change notifications. The callback reads the new value
    /// through [`current`](Self::current).
    fn subscribe(&self, callback: HealthCallback) -> Unsubscribe;

    fn current(&self) -> HealthSnapshot;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_requires_enabled_healthy_and_address() {
        assert!(HealthSnapshot::healthy("localhost:6876").is_available());
        assert!(!HealthSnapshot::unhealthy(Some("localhost:6876".into())).is_available());

        let disabled = HealthSnapshot {
            enabled: false,
            ..HealthSnapshot::healthy("localhost:6876")
        };
        assert!(!disabled.is_available());
        assert!(!HealthSnapshot::default().is_available());

        let nowhere = HealthSnapshot {
            address: None,
            ..HealthSnapshot::healthy("localhost:6876")
        };
        assert!(!nowhere.is_available());
        assert!(!HealthSnapshot::healthy("").is_available());
    }

    #[test]
    fn test_connection_params_builder() {
        let params = ConnectionParams::new()
            .user("materialize")
            .option("cluster", "quickstart");
        assert_eq!(params.user.as_deref(), Some("materialize"));
        assert!(params.password.is_none());
        assert_eq!(params.options.get("cluster").map(String::as_str), Some("quickstart"));

        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"user": "materialize", "options": {"cluster": "quickstart"}})
        );
    }
}
