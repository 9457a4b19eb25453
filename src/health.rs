//! Pool health check.

use std::sync::atomic::Ordering;

use crate::backend::{Connector, DatabaseConnection, DatabasePool};
use crate::classify::{classify_error, ErrorClass};
use crate::error::{Result, SentinelError};
use crate::manager::PoolManager;
use crate::pg::PgResult;
use crate::state::PoolHandle;

/// Round trip used by health checks and keep-alive probes.
pub const PROBE_STATEMENT: &str = "SELECT 1";

impl<C: Connector> PoolManager<C> {
    /// Probe `handle` with one round trip.
    ///
    /// Returns `Ok(true)` if the pool answered. If the database terminated
    /// the connection the pool is discarded and `Ok(false)` returned; any
    /// other failure is returned as an error.
    pub async fn check_health(&self, handle: &PoolHandle<C::Pool>) -> Result<bool> {
        self.counters().health_checks.fetch_add(1, Ordering::Relaxed);

        match probe(handle.pool()).await {
            Ok(()) => {
                self.touch();
                tracing::trace!(pool_id = handle.id(), "health check passed");
                Ok(true)
            }
            Err(e) if classify_error(&e) == ErrorClass::Termination => {
                tracing::warn!(
                    pool_id = handle.id(),
                    error = %e,
                    "health check found a terminated connection; discarding pool"
                );
                self.discard(handle.id()).await;
                Ok(false)
            }
            Err(e) => Err(SentinelError::database(e)),
        }
    }
}

async fn probe<P: DatabasePool>(pool: &P) -> PgResult<()> {
    let mut conn = pool.acquire().await?;
    conn.query(PROBE_STATEMENT, &[]).await?;
    Ok(())
}
