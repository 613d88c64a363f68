//! SUBSCRIBE Statement Builder
//!
//! Builds the streaming statement the reducer sends whenever its connection
//! opens:
//!
//! ```text
//! SUBSCRIBE (<query>) WITH (PROGRESS)
//! [AS OF AT LEAST TIMESTAMP '<iso8601>']
//! ENVELOPE UPSERT (KEY (<col1>[, <col2>...]));
//! ```
//!
//! ## Rules
//! - `WITH (PROGRESS)` is always emitted. Without progress rows the reducer
//!   can never tell a complete snapshot from a partial backlog.
//! - The upsert key is mandatory. Columns are double-quoted and emitted in
//!   the order given.
//! - `AS OF AT LEAST` is a lower bound on freshness, not an exact resumption
//!   point. The reducer sets it to its last watermark when it re-subscribes.
//!
//! Building is pure; the same request can be rendered any number of times
//! with different `as_of_at_least` values.
//!
//! ## Example
//! ```ignore
//! use livefeed_core::{SubscribeRequest, Timestamp};
//!
//! let request = SubscribeRequest::new("SELECT id, name FROM users", "id")?;
//! assert_eq!(
//!     request.statement()?,
//!     r#"SUBSCRIBE (SELECT id, name FROM users) WITH (PROGRESS) ENVELOPE UPSERT (KEY ("id"));"#
//! );
//!
//! let resumed = request.resume_from(Timestamp::from_millis(1_700_000_000_000));
//! // ... AS OF AT LEAST TIMESTAMP '2023-11-14T22:13:20.000Z' ...
//! ```

use crate::error::{Error, Result};
use crate::timestamp::Timestamp;

/// The ordered list of columns that identify a row in the upsert envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertKey(Vec<String>);

impl UpsertKey {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(columns.into_iter().map(Into::into).collect())
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::MissingUpsertKey);
        }
        if let Some(column) = self.0.iter().find(|c| c.trim().is_empty()) {
            return Err(Error::InvalidKeyColumn(column.clone()));
        }
        Ok(())
    }
}

impl From<&str> for UpsertKey {
    fn from(column: &str) -> Self {
        Self(vec![column.to_string()])
    }
}

impl From<String> for UpsertKey {
    fn from(column: String) -> Self {
        Self(vec![column])
    }
}

impl From<Vec<String>> for UpsertKey {
    fn from(columns: Vec<String>) -> Self {
        Self(columns)
    }
}

impl From<Vec<&str>> for UpsertKey {
    fn from(columns: Vec<&str>) -> Self {
        Self::new(columns)
    }
}

impl From<&[&str]> for UpsertKey {
    fn from(columns: &[&str]) -> Self {
        Self::new(columns.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for UpsertKey {
    fn from(columns: [&str; N]) -> Self {
        Self::new(columns)
    }
}

/// Options rendered into the statement around the inner query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub upsert_key: UpsertKey,
    pub as_of_at_least: Option<Timestamp>,
}

impl SubscribeOptions {
    pub fn new(upsert_key: impl Into<UpsertKey>) -> Self {
        Self {
            upsert_key: upsert_key.into(),
            as_of_at_least: None,
        }
    }

    pub fn as_of_at_least(mut self, timestamp: Timestamp) -> Self {
        self.as_of_at_least = Some(timestamp);
        self
    }
}

/// Quote an identifier the way it is referenced in the query's output:
/// wrapped in double quotes, embedded quotes doubled.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render the `SUBSCRIBE` statement for `query`.
///
/// # Errors
///
/// - `EmptyQuery` if the query is blank once trailing semicolons are removed
/// - `MissingUpsertKey` / `InvalidKeyColumn` for a bad key
/// - `InvalidTimestamp` if `as_of_at_least` cannot be rendered
pub fn build_subscribe(query: &str, options: &SubscribeOptions) -> Result<String> {
    let inner = normalize_query(query)?;
    options.upsert_key.validate()?;

    let as_of = match options.as_of_at_least {
        Some(ts) => format!(" AS OF AT LEAST TIMESTAMP '{}'", ts.to_iso8601()?),
        None => String::new(),
    };

    let key = options
        .upsert_key
        .columns()
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!(
        "SUBSCRIBE ({inner}) WITH (PROGRESS){as_of} ENVELOPE UPSERT (KEY ({key}));"
    ))
}

fn normalize_query(query: &str) -> Result<&str> {
    let trimmed = query.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if trimmed.is_empty() {
        return Err(Error::EmptyQuery);
    }
    Ok(trimmed)
}

/// A validated subscription request: the inner query plus its options.
///
/// Construction validates eagerly so configuration mistakes surface when the
/// subscription is built, never mid-stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    query: String,
    options: SubscribeOptions,
}

impl SubscribeRequest {
    pub fn new(query: impl Into<String>, upsert_key: impl Into<UpsertKey>) -> Result<Self> {
        Self::with_options(query, SubscribeOptions::new(upsert_key))
    }

    pub fn with_options(query: impl Into<String>, options: SubscribeOptions) -> Result<Self> {
        let query = query.into();
        normalize_query(&query)?;
        options.upsert_key.validate()?;
        Ok(Self { query, options })
    }

    /// Request that the stream reflect state no older than `timestamp`.
    pub fn as_of_at_least(mut self, timestamp: Timestamp) -> Self {
        self.options.as_of_at_least = Some(timestamp);
        self
    }

    /// A copy of this request that resumes from `watermark`.
    ///
    /// The caller's own lower bound still applies: resuming never asks for
    /// state older than the original `as_of_at_least`.
    pub fn resume_from(&self, watermark: Timestamp) -> Self {
        let start = match self.options.as_of_at_least {
            Some(requested) => requested.max(watermark),
            None => watermark,
        };
        self.clone().as_of_at_least(start)
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    pub fn upsert_key(&self) -> &UpsertKey {
        &self.options.upsert_key
    }

    /// The lower bound the first progress row must reach before the snapshot
    /// counts as complete.
    pub fn start_at(&self) -> Option<Timestamp> {
        self.options.as_of_at_least
    }

    pub fn statement(&self) -> Result<String> {
        build_subscribe(&self.query, &self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_key() {
        let sql = build_subscribe("SELECT * FROM t", &SubscribeOptions::new("id")).unwrap();
        assert_eq!(
            sql,
            r#"SUBSCRIBE (SELECT * FROM t) WITH (PROGRESS) ENVELOPE UPSERT (KEY ("id"));"#
        );
    }

    #[test]
    fn test_composite_key_keeps_order() {
        let sql =
            build_subscribe("SELECT * FROM t", &SubscribeOptions::new(["b", "a"])).unwrap();
        assert!(sql.ends_with(r#"ENVELOPE UPSERT (KEY ("b", "a"));"#));
    }

    #[test]
    fn test_as_of_at_least() {
        let options = SubscribeOptions::new("id").as_of_at_least(Timestamp::from_millis(0));
        let sql = build_subscribe("SELECT 1 AS id", &options).unwrap();
        assert_eq!(
            sql,
            "SUBSCRIBE (SELECT 1 AS id) WITH (PROGRESS) AS OF AT LEAST TIMESTAMP \
             '1970-01-01T00:00:00.000Z' ENVELOPE UPSERT (KEY (\"id\"));"
        );
    }

    #[test]
    fn test_trailing_semicolons_stripped() {
        let sql = build_subscribe("  SELECT 1 AS id ; ;\n", &SubscribeOptions::new("id")).unwrap();
        assert!(sql.starts_with("SUBSCRIBE (SELECT 1 AS id) WITH"));
    }

    #[test]
    fn test_quote_identifier_escapes() {
        assert_eq!(quote_identifier("id"), "\"id\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_identifier("Mixed Case"), "\"Mixed Case\"");
    }

    #[test]
    fn test_empty_query_rejected() {
        assert_eq!(
            build_subscribe(" ; ", &SubscribeOptions::new("id")),
            Err(Error::EmptyQuery)
        );
    }

    #[test]
    fn test_empty_key_rejected() {
        assert_eq!(
            SubscribeRequest::new("SELECT 1", Vec::<String>::new()),
            Err(Error::MissingUpsertKey)
        );
        assert_eq!(
            SubscribeRequest::new("SELECT 1", vec!["id", " "]),
            Err(Error::InvalidKeyColumn(" ".to_string()))
        );
    }

    #[test]
    fn test_resume_from_sets_lower_bound() {
        let request = SubscribeRequest::new("SELECT 1 AS id", "id").unwrap();
        assert_eq!(request.start_at(), None);

        let resumed = request.resume_from(Timestamp::from_millis(1_700_000_000_000));
        assert_eq!(resumed.start_at(), Some(Timestamp::from_millis(1_700_000_000_000)));
        assert!(resumed
            .statement()
            .unwrap()
            .contains("AS OF AT LEAST TIMESTAMP '2023-11-14T22:13:20.000Z'"));

        // The original is untouched.
        assert!(!request.statement().unwrap().contains("AS OF"));
    }

    #[test]
    fn test_repeated_builds_are_identical() {
        let request = SubscribeRequest::new("SELECT 1 AS id", "id").unwrap();
        assert_eq!(request.statement().unwrap(), request.statement().unwrap());
    }
}
