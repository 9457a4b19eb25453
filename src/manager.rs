//! Process-wide pool manager.
//!
//! [`PoolManager`] owns at most one pool at a time. The pool is created
//! lazily by [`PoolManager::get_pool`], discarded when the database is found
//! to have terminated its connections, and rebuilt by the next caller.
//! Every pool instance gets its own keep-alive task and pool-event watcher;
//! both stop when the pool is discarded or the manager is cleaned up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{Connector, DatabasePool, PgConnector};
use crate::classify::{classify_error, ErrorClass};
use crate::config::{redacted_url, ManagerConfig, TargetKind};
use crate::error::{Result, SentinelError};
use crate::keepalive::{run_keep_alive, PoolTasks};
use crate::outcome::QueryOutcome;
use crate::pg::{PoolEvent, Row, Value};
use crate::retry::RetryExecutor;
use crate::state::{PoolHandle, PoolState};

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub pools_created: u64,
    pub pools_discarded: u64,
    pub health_checks: u64,
    pub retries: u64,
    pub has_pool: bool,
    /// Time since the last successful round trip or statement.
    pub idle_for: Duration,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub pools_created: AtomicU64,
    pub pools_discarded: AtomicU64,
    pub health_checks: AtomicU64,
    pub retries: AtomicU64,
}

pub(crate) struct Shared<C: Connector> {
    connector: C,
    config: ManagerConfig,
    state: Mutex<PoolState<C::Pool>>,
    /// Serializes pool creation so racing callers build one pool.
    create_lock: tokio::sync::Mutex<()>,
    /// Cancelled by `cleanup()`; replaced so the manager stays usable.
    shutdown: Mutex<CancellationToken>,
    pub(crate) counters: Counters,
}

impl<C: Connector> Drop for Shared<C> {
    fn drop(&mut self) {
        if let Some(tasks) = self.state.get_mut().tasks.take() {
            tasks.cancel();
        }
    }
}

/// Hands out a shared, self-healing connection pool.
///
/// Cheap to clone; clones share the same pool.
pub struct PoolManager<C: Connector = PgConnector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for PoolManager<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl PoolManager<PgConnector> {
    /// Manager for the PostgreSQL server named by `DATABASE_URL`.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(PgConnector, ManagerConfig::from_env()?))
    }
}

impl<C: Connector> PoolManager<C> {
    pub fn new(connector: C, config: ManagerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                state: Mutex::new(PoolState::new()),
                create_lock: tokio::sync::Mutex::new(()),
                shutdown: Mutex::new(CancellationToken::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub(crate) fn upgrade(shared: &Weak<Shared<C>>) -> Option<Self> {
        shared.upgrade().map(|shared| Self { shared })
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.shared.counters
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// The live pool, if one exists. Never creates one.
    pub fn current(&self) -> Option<PoolHandle<C::Pool>> {
        self.shared.state.lock().slot.clone()
    }

    /// The current pool, creating it if absent.
    ///
    /// Concurrent callers that find no pool wait for a single creation. A
    /// missing or malformed connection string fails here with a
    /// configuration error before any network activity.
    pub async fn get_pool(&self) -> Result<PoolHandle<C::Pool>> {
        if let Some(handle) = self.current() {
            return Ok(handle);
        }

        let _creating = self.shared.create_lock.lock().await;
        if let Some(handle) = self.current() {
            return Ok(handle);
        }

        let settings = self.shared.config.pool_settings()?;
        let pool = self
            .shared
            .connector
            .connect(&settings)
            .await
            .map_err(SentinelError::database)?;
        let events = pool.take_events();

        let id = self.shared.state.lock().allocate_id();
        let handle = PoolHandle::new(id, pool);
        let tasks = self.spawn_pool_tasks(id, events);

        {
            let mut state = self.shared.state.lock();
            state.slot = Some(handle.clone());
            state.tasks = Some(tasks);
            state.last_activity = Instant::now();
        }
        self.shared.counters.pools_created.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            pool_id = id,
            target = ?TargetKind::detect(&settings.url),
            url = %redacted_url(&settings.url),
            max_connections = settings.max_connections,
            tls = ?settings.tls,
            "database pool created"
        );

        Ok(handle)
    }

    fn spawn_pool_tasks(
        &self,
        pool_id: u64,
        events: Option<UnboundedReceiver<PoolEvent>>,
    ) -> PoolTasks {
        let mut tasks = PoolTasks::new();
        let weak = Arc::downgrade(&self.shared);

        tasks.push(tokio::spawn(run_keep_alive(
            weak.clone(),
            pool_id,
            tasks.token(),
            self.shared.config.keep_alive_period,
        )));

        if let Some(events) = events {
            tasks.push(tokio::spawn(watch_events(weak, pool_id, tasks.token(), events)));
        }

        tasks
    }

    /// Drop pool instance `pool_id` from the slot and close it.
    ///
    /// Returns false if that instance is no longer current. Close errors are
    /// logged and swallowed.
    pub(crate) async fn discard(&self, pool_id: u64) -> bool {
        let taken = self.shared.state.lock().take_if(pool_id);
        let Some((handle, tasks)) = taken else {
            return false;
        };
        self.shared.counters.pools_discarded.fetch_add(1, Ordering::Relaxed);
        tracing::info!(pool_id, "discarding database pool");

        if let Err(e) = handle.close().await {
            tracing::debug!(pool_id, error = %e, "error closing discarded pool");
        }
        // Cancel last: this may run on one of the pool's own tasks.
        if let Some(tasks) = tasks {
            tasks.cancel();
        }
        true
    }

    /// Stop background tasks, close the pool and cancel in-flight retry
    /// backoffs.
    ///
    /// Idempotent and infallible. The manager can be used again afterwards;
    /// the next `get_pool()` builds a new pool.
    pub async fn cleanup(&self) {
        let token = std::mem::replace(&mut *self.shared.shutdown.lock(), CancellationToken::new());
        token.cancel();

        let taken = self.shared.state.lock().take();
        let Some((handle, tasks)) = taken else {
            tracing::debug!("cleanup: no pool to close");
            return;
        };

        if let Some(tasks) = tasks {
            tasks.shutdown().await;
        }
        if let Err(e) = handle.close().await {
            tracing::warn!(pool_id = handle.id(), error = %e, "error closing pool during cleanup");
        }
        self.shared.counters.pools_discarded.fetch_add(1, Ordering::Relaxed);
        tracing::info!(pool_id = handle.id(), "database pool closed");
    }

    /// Token cancelled by the next `cleanup()`.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.lock().clone()
    }

    /// Record database activity now.
    pub(crate) fn touch(&self) {
        self.shared.state.lock().last_activity = Instant::now();
    }

    /// Time since the last recorded database activity.
    pub fn idle_for(&self) -> Duration {
        self.shared.state.lock().last_activity.elapsed()
    }

    pub fn stats(&self) -> ManagerStats {
        let (has_pool, idle_for) = {
            let state = self.shared.state.lock();
            (state.slot.is_some(), state.last_activity.elapsed())
        };
        let counters = &self.shared.counters;
        ManagerStats {
            pools_created: counters.pools_created.load(Ordering::Relaxed),
            pools_discarded: counters.pools_discarded.load(Ordering::Relaxed),
            health_checks: counters.health_checks.load(Ordering::Relaxed),
            retries: counters.retries.load(Ordering::Relaxed),
            has_pool,
            idle_for,
        }
    }

    /// Run one statement with termination retries. See [`RetryExecutor`].
    pub async fn execute(&self, statement: &str, params: &[Value]) -> Result<QueryOutcome> {
        RetryExecutor::new(self.clone()).execute(statement, params).await
    }

    /// Like [`execute`](Self::execute), returning only the rows.
    pub async fn query(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>> {
        Ok(self.execute(statement, params).await?.rows)
    }
}

/// Invalidate the pool when it reports that the server closed a connection.
/// Other pool errors are only logged; no caller ever sees them.
async fn watch_events<C: Connector>(
    shared: Weak<Shared<C>>,
    pool_id: u64,
    token: CancellationToken,
    mut events: UnboundedReceiver<PoolEvent>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(PoolEvent::ConnectionLost { error }) = event else {
            break;
        };
        let Some(manager) = PoolManager::upgrade(&shared) else {
            break;
        };

        match classify_error(&error) {
            ErrorClass::Termination => {
                tracing::warn!(
                    pool_id,
                    error = %error,
                    "database terminated an idle connection; pool will be rebuilt on next use"
                );
                manager.discard(pool_id).await;
                break;
            }
            class => {
                tracing::warn!(pool_id, class = %class, error = %error, "pool error");
            }
        }
    }
}
