//! Error Types for livefeed core
//!
//! Everything in this crate is pure, so the only failures are caller
//! configuration errors caught while building a request, and malformed
//! timestamps coming off the wire.
//!
//! ## Error Categories
//!
//! ### Request Errors
//! - `EmptyQuery`: the inner query is blank
//! - `MissingUpsertKey`: no upsert key columns were given
//! - `InvalidKeyColumn`: a key column name is blank
//!
//! ### Data Errors
//! - `InvalidTimestamp`: a logical timestamp could not be parsed or rendered
//!
//! ## Example
//! ```ignore
//! use livefeed_core::{Error, SubscribeRequest};
//!
//! match SubscribeRequest::new("SELECT * FROM t", Vec::<String>::new()) {
//!     Err(Error::MissingUpsertKey) => eprintln!("pick a key"),
//!     _ => {}
//! }
//! ```

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Subscribe query is empty")]
    EmptyQuery,

    #[error("Upsert key must name at least one column")]
    MissingUpsertKey,

    #[error("Invalid upsert key column: {0:?}")]
    InvalidKeyColumn(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, Error>;
