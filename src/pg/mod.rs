//! PostgreSQL wire protocol implementation.
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `types`: Type OIDs
//! - `encoding`: Binary codecs between `Value` and wire payloads
//! - `connection`: Connection state machine and the extended query flow
//! - `statement`: Per-connection prepared statement cache
//! - `pool`: Bounded connection pool with an RAII release policy
//! - `scram`: SCRAM-SHA-256 authentication

pub mod connection;
pub mod encoding;
pub mod pool;
pub mod protocol;
pub mod scram;
pub mod statement;
pub mod types;


pub use connection::{
    tcp_connector, AsyncStream, BoxStream, ConnectionState, Connector, PgConnection, QueryResult,
};
pub use pool::{PgPool, PooledConnection};
pub use types::Oid;
