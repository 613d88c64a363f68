//! In-process [`HealthSignal`] that owners update imperatively.
//!
//! A health checker (or the CLI, which assumes the endpoint is up) writes
//! into a `HealthBoard`; every connection manager subscribed to it reacts to
//! the change. Writes that leave the snapshot unchanged notify nobody.

use parking_lot::RwLock;
use tracing::debug;

use crate::listeners::{Listeners, Unsubscribe};
use crate::target::{HealthCallback, HealthSignal, HealthSnapshot};

#[derive(Default)]
pub struct HealthBoard {
    snapshot: RwLock<HealthSnapshot>,
    listeners: Listeners<()>,
}

impl HealthBoard {
    pub fn new(initial: HealthSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(initial),
            listeners: Listeners::new(),
        }
    }

    /// A board reporting `address` as enabled and healthy.
    pub fn healthy(address: impl Into<String>) -> Self {
        Self::new(HealthSnapshot::healthy(address))
    }

    /// Apply `f` to the snapshot and notify subscribers if anything changed.
    ///
    /// Returns whether subscribers were notified.
    pub fn update(&self, f: impl FnOnce(&mut HealthSnapshot)) -> bool {
        let changed = {
            let mut snapshot = self.snapshot.write();
            let before = snapshot.clone();
            f(&mut snapshot);
            if *snapshot != before {
                debug!(
                    enabled = snapshot.enabled,
                    healthy = snapshot.healthy,
                    address = ?snapshot.address,
                    "Health changed"
                );
                true
            } else {
                false
            }
        };

        if changed {
            self.listeners.emit(&());
        }
        changed
    }

    pub fn set(&self, snapshot: HealthSnapshot) -> bool {
        self.update(|current| *current = snapshot)
    }

    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.update(|current| current.healthy = healthy)
    }

    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.update(|current| current.enabled = enabled)
    }

    pub fn set_address(&self, address: Option<String>) -> bool {
        self.update(|current| current.address = address)
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }
}

impl HealthSignal for HealthBoard {
    fn subscribe(&self, callback: HealthCallback) -> Unsubscribe {
        self.listeners.register(move |_| callback())
    }

    fn current(&self) -> HealthSnapshot {
        self.snapshot.read().clone()
    }
}
