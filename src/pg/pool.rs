//! PostgreSQL connection pool.
//!
//! A semaphore bounds the number of checked-out connections. Idle
//! connections are kept with the time they were returned; those idle for
//! longer than `idle_timeout` are closed rather than reused. A background
//! maintenance task reaps expired connections and notices connections the
//! server closed while they sat idle, reporting them as [`PoolEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::connection::{PgConfig, PgConnection, QueryResult};
use super::error::{PgError, PgResult};
use super::protocol::TransactionStatus;
use super::tls::TlsMode;
use super::types::Value;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PgPoolConfig {
    /// Database connection URL
    pub url: String,
    /// Connections opened when the pool is created
    pub min_connections: u32,
    /// Maximum number of checked-out connections
    pub max_connections: u32,
    /// Idle connections older than this are closed instead of reused
    pub idle_timeout: Duration,
    /// Bound on waiting for a free slot plus establishing a connection
    pub connect_timeout: Duration,
    /// Overrides the URL's `sslmode` when set
    pub tls: Option<TlsMode>,
    /// Statement cache capacity per connection (0 disables named statements)
    pub statement_cache_capacity: usize,
    /// Reported to the server as `application_name`
    pub application_name: Option<String>,
}

impl PgPoolConfig {
    /// Create a new pool configuration.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            min_connections: 1,
            max_connections: 10,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            tls: None,
            statement_cache_capacity: 100,
            application_name: None,
        }
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn tls(mut self, mode: TlsMode) -> Self {
        self.tls = Some(mode);
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Connection settings derived from the URL plus pool-level overrides.
    pub fn connection_config(&self) -> PgResult<PgConfig> {
        let mut pg_config = PgConfig::from_url(&self.url)?;
        if let Some(mode) = self.tls {
            pg_config.tls = mode;
        }
        if let Some(name) = &self.application_name {
            pg_config.application_name = Some(name.clone());
        }
        pg_config.statement_cache_capacity = self.statement_cache_capacity;
        Ok(pg_config)
    }
}

/// Something that happened to the pool outside of any caller's checkout.
#[derive(Debug)]
pub enum PoolEvent {
    /// An idle connection was closed by the server or failed while idle.
    ConnectionLost { error: PgError },
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, the connection is returned to the pool if it is still
/// usable; otherwise it is discarded and its slot freed.
pub struct PooledConnection {
    conn: Option<PgConnection>,
    pool: Arc<PgPoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Execute a parameterized statement.
    pub async fn query(&mut self, query: &str, params: &[Value]) -> PgResult<QueryResult> {
        self.conn
            .as_mut()
            .ok_or(PgError::ConnectionClosed)?
            .query(query, params)
            .await
    }

    /// Check if the connection is healthy.
    pub fn is_healthy(&self) -> bool {
        self.conn.as_ref().map(|c| !c.is_closed()).unwrap_or(false)
    }

    pub fn connection(&self) -> Option<&PgConnection> {
        self.conn.as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // A connection left inside a transaction would leak its state
            // into the next checkout.
            let reusable = !conn.is_closed()
                && conn.transaction_status() == TransactionStatus::Idle
                && !self.pool.closed.load(Ordering::Acquire);

            if reusable {
                self.pool.idle.lock().push(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                });
            } else {
                tracing::trace!(
                    backend_pid = conn.backend_pid(),
                    closed = conn.is_closed(),
                    "discarding connection on release"
                );
            }
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct IdleConnection {
    conn: PgConnection,
    idle_since: Instant,
}

struct PgPoolInner {
    config: PgPoolConfig,
    idle: Mutex<Vec<IdleConnection>>,
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
    events: UnboundedSender<PoolEvent>,
    event_rx: Mutex<Option<UnboundedReceiver<PoolEvent>>>,
    maintenance: CancellationToken,
}

impl PgPoolInner {
    fn pop_idle(&self) -> Option<IdleConnection> {
        self.idle.lock().pop()
    }

    fn is_expired(&self, idle: &IdleConnection) -> bool {
        idle.idle_since.elapsed() >= self.config.idle_timeout
    }

    /// One maintenance pass: close expired connections, detect dead ones.
    async fn reap(&self) {
        let candidates = std::mem::take(&mut *self.idle.lock());
        let mut keep = Vec::with_capacity(candidates.len());

        for mut idle in candidates {
            if self.is_expired(&idle) {
                tracing::trace!(
                    backend_pid = idle.conn.backend_pid(),
                    "closing expired idle connection"
                );
                let _ = idle.conn.close().await;
                continue;
            }

            match idle.conn.poll_unsolicited().await {
                Ok(()) => keep.push(idle),
                Err(error) => {
                    tracing::debug!(error = %error, "idle connection lost");
                    let _ = self.events.send(PoolEvent::ConnectionLost { error });
                }
            }
        }

        if self.closed.load(Ordering::Acquire) {
            for mut idle in keep {
                let _ = idle.conn.close().await;
            }
            return;
        }

        self.idle.lock().extend(keep);
    }
}

fn maintenance_period(idle_timeout: Duration) -> Duration {
    (idle_timeout / 3).clamp(Duration::from_secs(1), Duration::from_secs(10))
}

async fn run_maintenance(pool: Weak<PgPoolInner>, token: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = pool.upgrade() else { break };
                inner.reap().await;
            }
        }
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A PostgreSQL connection pool.
///
/// The pool maintains a set of reusable connections, each with its own
/// prepared statement cache.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PgPoolInner>,
}

impl PgPool {
    /// Create a pool, opening `min_connections` connections up front.
    pub async fn connect(config: PgPoolConfig) -> PgResult<Self> {
        // Fail fast on a malformed URL before any network activity.
        config.connection_config()?;

        let (events, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PgPoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_connections.max(1) as usize)),
            config,
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            events,
            event_rx: Mutex::new(Some(event_rx)),
            maintenance: CancellationToken::new(),
        });

        let pool = Self { inner };

        let warm = pool.inner.config.min_connections.min(pool.inner.config.max_connections);
        for _ in 0..warm {
            let conn = pool.create_connection().await?;
            pool.inner.idle.lock().push(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
        }

        tokio::spawn(run_maintenance(
            Arc::downgrade(&pool.inner),
            pool.inner.maintenance.clone(),
            maintenance_period(pool.inner.config.idle_timeout),
        ));

        Ok(pool)
    }

    /// Get a connection from the pool.
    ///
    /// Waiting for a free slot and opening a new connection together are
    /// bounded by `connect_timeout`.
    pub async fn acquire(&self) -> PgResult<PooledConnection> {
        if self.is_closed() {
            return Err(PgError::PoolClosed);
        }

        tokio::time::timeout(self.inner.config.connect_timeout, self.acquire_inner())
            .await
            .map_err(|_| PgError::Timeout)?
    }

    async fn acquire_inner(&self) -> PgResult<PooledConnection> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PgError::PoolClosed)?;

        while let Some(mut idle) = self.inner.pop_idle() {
            if self.inner.is_expired(&idle) {
                let _ = idle.conn.close().await;
                continue;
            }
            match idle.conn.poll_unsolicited().await {
                Ok(()) => {
                    return Ok(PooledConnection {
                        conn: Some(idle.conn),
                        pool: Arc::clone(&self.inner),
                        _permit: permit,
                    })
                }
                Err(e) => {
                    tracing::debug!(error = %e, "discarding dead idle connection");
                }
            }
        }

        let conn = self.create_connection().await?;
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Execute a parameterized query on a pooled connection.
    pub async fn query(&self, query: &str, params: &[Value]) -> PgResult<QueryResult> {
        let mut conn = self.acquire().await?;
        conn.query(query, params).await
    }

    /// Close the pool: reject new checkouts, stop maintenance and terminate
    /// idle connections. Checked-out connections are dropped when returned.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.maintenance.cancel();
        self.inner.semaphore.close();

        let connections = std::mem::take(&mut *self.inner.idle.lock());
        for mut idle in connections {
            let _ = idle.conn.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Receiver of asynchronous pool events. Yields `Some` only once.
    pub fn take_events(&self) -> Option<UnboundedReceiver<PoolEvent>> {
        self.inner.event_rx.lock().take()
    }

    /// Get the current number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Number of connections currently checked out.
    pub fn in_use(&self) -> usize {
        let max = self.inner.config.max_connections.max(1) as usize;
        max.saturating_sub(self.inner.semaphore.available_permits())
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PgPoolConfig {
        &self.inner.config
    }

    async fn create_connection(&self) -> PgResult<PgConnection> {
        let pg_config = self.inner.config.connection_config()?;
        tokio::time::timeout(
            self.inner.config.connect_timeout,
            PgConnection::connect_with_config(pg_config),
        )
        .await
        .map_err(|_| PgError::Timeout)?
    }
}

impl Drop for PgPoolInner {
    fn drop(&mut self) {
        self.maintenance.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config() {
        let config = PgPoolConfig::new("postgresql://localhost/test")
            .min_connections(0)
            .max_connections(3)
            .idle_timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(2))
            .tls(TlsMode::Require)
            .statement_cache_capacity(0);

        assert_eq!(config.min_connections, 0);
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.tls, Some(TlsMode::Require));
        assert_eq!(config.statement_cache_capacity, 0);
    }

    #[test]
    fn test_connection_config_applies_overrides() {
        let pg = PgPoolConfig::new("postgres://u:p@db.example.com/app?sslmode=disable")
            .tls(TlsMode::Require)
            .statement_cache_capacity(0)
            .application_name("worker")
            .connection_config()
            .unwrap();

        assert_eq!(pg.tls, TlsMode::Require);
        assert_eq!(pg.statement_cache_capacity, 0);
        assert_eq!(pg.application_name.as_deref(), Some("worker"));
    }

    #[test]
    fn test_maintenance_period_is_clamped() {
        assert_eq!(maintenance_period(Duration::from_secs(30)), Duration::from_secs(10));
        assert_eq!(maintenance_period(Duration::from_secs(9)), Duration::from_secs(3));
        assert_eq!(maintenance_period(Duration::from_millis(300)), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url_without_network() {
        let result = PgPool::connect(PgPoolConfig::new("mysql://localhost/db")).await;
        assert!(matches!(result, Err(PgError::Config(_))));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let pool = PgPool::connect(PgPoolConfig::new("postgres://localhost/db").min_connections(0))
            .await
            .unwrap();

        assert!(pool.take_events().is_some());
        assert!(pool.take_events().is_none());

        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(PgError::PoolClosed)));
    }
}
