//! Logical Timestamps
//!
//! The database reports progress in logical time: an unsigned count of
//! milliseconds since the Unix epoch (`mz_timestamp` on the wire). This module
//! wraps that value so it can be ordered, compared against watermarks, and
//! rendered as the ISO-8601 literal `AS OF AT LEAST TIMESTAMP '...'` expects.
//!
//! ## Wire Forms
//! Timestamps arrive either as JSON numbers or, more commonly, as decimal
//! strings (the column is `numeric`, which does not fit a JSON double):
//!
//! ```text
//! "1700000000000"   -> Timestamp(1700000000000)
//! 1700000000000     -> Timestamp(1700000000000)
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A logical timestamp in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(0);

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Wall-clock now, truncated to milliseconds.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis().max(0) as u64)
    }

    /// Render as an ISO-8601 UTC string with millisecond precision,
    /// e.g. `2023-11-14T22:13:20.000Z`.
    ///
    /// Fails only for values beyond the range chrono can represent.
    pub fn to_iso8601(self) -> Result<String> {
        let millis = i64::try_from(self.0)
            .map_err(|_| Error::InvalidTimestamp(format!("{} is out of range", self.0)))?;

        Utc.timestamp_millis_opt(millis)
            .single()
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            .ok_or_else(|| Error::InvalidTimestamp(format!("{} is out of range", self.0)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(millis: u64) -> Self {
        Self(millis)
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|e| Error::InvalidTimestamp(format!("{s:?}: {e}")))
    }
}

impl TryFrom<&Value> for Timestamp {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => s.parse(),
            Value::Number(n) => n
                .as_u64()
                .map(Self)
                .ok_or_else(|| Error::InvalidTimestamp(format!("{n} is not an unsigned integer"))),
            other => Err(Error::InvalidTimestamp(format!("unexpected JSON value {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_iso8601_epoch() {
        assert_eq!(
            Timestamp::MIN.to_iso8601().unwrap(),
            "1970-01-01T00:00:00.000Z"
        );
    }

    #[test]
    fn test_iso8601_keeps_milliseconds() {
        let ts = Timestamp::from_millis(1_700_000_000_123);
        assert_eq!(ts.to_iso8601().unwrap(), "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn test_iso8601_out_of_range() {
        let ts = Timestamp::from_millis(u64::MAX);
        assert!(matches!(ts.to_iso8601(), Err(Error::InvalidTimestamp(_))));
    }

    #[test]
    fn test_parse_from_string() {
        let ts: Timestamp = " 1700000000000 ".parse().unwrap();
        assert_eq!(ts.as_millis(), 1_700_000_000_000);
        assert!("abc".parse::<Timestamp>().is_err());
        assert!("-5".parse::<Timestamp>().is_err());
    }

    #[test]
    fn test_try_from_json() {
        assert_eq!(
            Timestamp::try_from(&json!("42")).unwrap(),
            Timestamp::from_millis(42)
        );
        assert_eq!(
            Timestamp::try_from(&json!(42)).unwrap(),
            Timestamp::from_millis(42)
        );
        assert!(Timestamp::try_from(&json!(-1)).is_err());
        assert!(Timestamp::try_from(&json!(1.5)).is_err());
        assert!(Timestamp::try_from(&json!(null)).is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(Timestamp::from_millis(5) > Timestamp::from_millis(4));
        assert_eq!(Timestamp::from_millis(7).to_string(), "7");
    }
}
