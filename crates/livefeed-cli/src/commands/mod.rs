//! Command handlers for the livefeed CLI
//!
//! - subscribe: follow a query's live result set
//! - statement: print the generated SUBSCRIBE statement
//! - config: manage the config file

pub mod config;
pub mod statement;
pub mod subscribe;

pub use config::ConfigCommands;
pub use statement::StatementArgs;
pub use subscribe::SubscribeArgs;
