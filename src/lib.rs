//! pgasync - a non-blocking PostgreSQL client.
//!
//! Statements run on pooled connections over the binary extended protocol.
//! Values cross the wire through a typed codec registry, and every operation
//! is a future. `bridge` adapts those futures to completion handles and
//! callbacks.

pub mod bridge;
pub mod config;
pub mod datasource;
pub mod error;
pub mod pg;
pub mod row;
pub mod statement;
pub mod value;

#[cfg(test)]
mod testing;

pub use bridge::{
    bridge, on_complete, promise, AlreadyCompleted, Completion, CompletionDataSource,
    CompletionTransactionalDataSource, Promise,
};
pub use config::Config;
pub use datasource::{DataSource, TransactionalDataSource};
pub use error::{Error, Result, ServerError};
pub use pg::types::Oid;
pub use row::{Column, ColumnIndex, Row};
pub use statement::{PreparedStatement, Statement};
pub use value::{Array, Dimension, FromValue, Kind, Native, OffsetTime, Value};
