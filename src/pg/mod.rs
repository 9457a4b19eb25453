//! PostgreSQL wire protocol client and connection pool.
//!
//! This is the pool the manager drives:
//! - Extended query protocol with per-connection prepared statement cache
//! - TLS negotiation for managed databases and connection poolers
//! - Pool events for connections the server closes while idle
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `connection`: Connection state machine and management
//! - `types`: PostgreSQL type encoding/decoding
//! - `row`: Result rows
//! - `statement`: Prepared statement cache
//! - `tls`: SSLRequest negotiation and rustls configuration
//! - `pool`: Connection pool with idle reaping and pool events

pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod row;
pub mod scram;
pub mod statement;
pub mod tls;
pub mod types;


pub use connection::{PgConfig, PgConnection, QueryResult};
pub use error::{PgError, PgResult};
pub use pool::{PgPool, PgPoolConfig, PoolEvent, PooledConnection};
pub use row::Row;
pub use statement::{PreparedStatement, SharedColumns};
pub use tls::TlsMode;
pub use types::{Oid, Value};
