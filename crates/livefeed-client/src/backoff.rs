//! Reconnection Backoff with Jitter
//!
//! This module computes the delay before each automatic reconnection attempt
//! made by the [`ConnectionManager`](crate::ConnectionManager).
//!
//! ## Schedule
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  BackoffPolicy               │
//! │  - max_attempts: 5           │
//! │  - base_delay: 1s            │
//! │  - max_delay: 30s            │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Close #1: wait 1s   ± 25%
//!        ├─→ Close #2: wait 2s   ± 25%
//!        ├─→ Close #3: wait 4s   ± 25%
//!        ├─→ Close #4: wait 8s   ± 25%
//!        ├─→ Close #5: wait 16s  ± 25%
//!        └─→ Close #6: give up (status Failed)
//! ```
//!
//! ## Jitter
//!
//! Many consoles watching the same backend all lose their connection when it
//! restarts. Jitter spreads their reconnects out:
//!
//! ```text
//! delay = min(base_delay * 2^attempt, max_delay)
//! delay = round(delay + delay * 0.25 * u)      u ∈ [-1, 1]
//! ```
//!
//! `u` comes from a [`JitterSource`], so tests can pin it with
//! [`FixedJitter`] or replay a sequence with [`SeededJitter`].
//!
//! ## Examples
//!
//! ```ignore
//! use livefeed_client::backoff::{BackoffPolicy, FixedJitter, JitterSource};
//!
//! let policy = BackoffPolicy::default();
//! let jitter = FixedJitter(0.0);
//! assert_eq!(policy.delay_for(2, jitter.sample()), Duration::from_millis(4000));
//! ```

use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Fraction of the base delay that jitter may add or remove.
pub const JITTER_FRACTION: f64 = 0.25;

/// Exponential backoff configuration for reconnection attempts.
///
/// # Fields
///
/// * `max_attempts` - Consecutive failed attempts before giving up (default: 5)
/// * `base_delay` - Delay before the first retry (default: 1s)
/// * `max_delay` - Upper bound for the un-jittered delay (default: 30s)
///
/// # Backoff Calculation
///
/// ```text
/// delay = min(base_delay * 2^attempt, max_delay)
///
/// Example with defaults (1s base, 30s max):
/// - Attempt 0: 1s
/// - Attempt 1: 2s
/// - Attempt 2: 4s
/// - Attempt 3: 8s
/// - Attempt 4: 16s
/// - Attempt 5+: capped at 30s
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Consecutive failed attempts before the manager stops retrying
    pub max_attempts: u32,

    /// Delay for attempt 0
    pub base_delay: Duration,

    /// Cap applied before jitter
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Un-jittered delay for `attempt` (0-indexed).
    ///
    /// Saturates at `max_delay` instead of overflowing for large attempts.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let policy = BackoffPolicy::default();
    /// assert_eq!(policy.base_delay_for(0), Duration::from_millis(1000));
    /// assert_eq!(policy.base_delay_for(3), Duration::from_millis(8000));
    /// assert_eq!(policy.base_delay_for(10), Duration::from_millis(30000));
    /// ```
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let scaled = 1u64
            .checked_shl(attempt)
            .and_then(|factor| base_ms.checked_mul(factor))
            .unwrap_or(u64::MAX);

        Duration::from_millis(scaled.min(max_ms))
    }

    /// Jittered delay for `attempt`.
    ///
    /// `unit_jitter` is clamped to `[-1, 1]` and scales ±25% of the base
    /// delay. The result is rounded to the nearest millisecond.
    pub fn delay_for(&self, attempt: u32, unit_jitter: f64) -> Duration {
        let base_ms = self.base_delay_for(attempt).as_millis() as f64;
        let u = if unit_jitter.is_finite() {
            unit_jitter.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let jittered = base_ms + base_ms * JITTER_FRACTION * u;
        Duration::from_millis(jittered.round().max(0.0) as u64)
    }

    /// Whether `attempt` consecutive failures means giving up.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Source of the unit jitter `u ∈ [-1, 1]`.
pub trait JitterSource: Send + Sync {
    fn sample(&self) -> f64;
}

/// Uniform jitter from the thread-local RNG. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen_range(-1.0..=1.0)
    }
}

/// Reproducible jitter from a seeded RNG.
#[derive(Debug)]
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl JitterSource for SeededJitter {
    fn sample(&self) -> f64 {
        self.rng.lock().gen_range(-1.0..=1.0)
    }
}

/// Always the same jitter. `FixedJitter(0.0)` disables jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}
