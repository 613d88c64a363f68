//! livefeed core
//!
//! Shared vocabulary for the change-feed subscription engine:
//!
//! - [`Timestamp`]: logical time as reported by the database (milliseconds since epoch)
//! - [`SubscribeRequest`] / [`build_subscribe`]: the `SUBSCRIBE ... ENVELOPE UPSERT` statement
//! - [`Frame`] / [`Row`]: decoded stream events folded by the client's reducer
//!
//! Nothing in this crate performs I/O.

pub mod error;
pub mod frame;
pub mod statement;
pub mod timestamp;

pub use error::{Error, Result};
pub use frame::{DataFrame, Frame, ProtocolError, Row, UpsertOp};
pub use statement::{build_subscribe, quote_identifier, SubscribeOptions, SubscribeRequest, UpsertKey};
pub use timestamp::Timestamp;
