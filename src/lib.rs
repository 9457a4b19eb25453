//! pgsentinel - a self-healing PostgreSQL connection pool manager.
//!
//! [`PoolManager`] keeps one pool per process, rebuilds it when the server
//! terminates its connections, retries statements that failed because of
//! such a termination, and keeps idle connections warm with a background
//! probe.
//!
//! ```no_run
//! # async fn run() -> pgsentinel::Result<()> {
//! use pgsentinel::{PoolManager, Value};
//!
//! let manager = PoolManager::from_env()?;
//! let shutdown = pgsentinel::spawn_cleanup_on_signal(manager.clone());
//!
//! let outcome = manager
//!     .execute("SELECT name FROM products WHERE id = $1", &[Value::Int4(7)])
//!     .await?;
//! println!("{} rows in {:.1}ms", outcome.rows.len(), outcome.duration_ms());
//! # let _ = shutdown;
//! # Ok(())
//! # }
//! ```

mod backend;
mod classify;
pub mod config;
mod error;
mod health;
mod keepalive;
mod manager;
mod outcome;
pub mod pg;
mod retry;
mod shutdown;
mod state;

#[cfg(test)]
mod mock;

pub use backend::{Connector, DatabaseConnection, DatabasePool, PgConnector};
pub use classify::{classify, classify_error, ErrorClass};
pub use config::{redacted_url, ManagerConfig, TargetKind};
pub use error::{Result, SentinelError};
pub use health::PROBE_STATEMENT;
pub use keepalive::KeepAliveTick;
pub use manager::{ManagerStats, PoolManager};
pub use outcome::QueryOutcome;
pub use pg::{PgError, Row, Value};
pub use retry::{RetryExecutor, RetryPolicy};
pub use shutdown::{cleanup_on_signal, shutdown_signal, spawn_cleanup_on_signal};
pub use state::PoolHandle;
