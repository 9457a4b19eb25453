//! The seam between the manager and a concrete connection pool.
//!
//! [`PgConnector`] builds the crate's own [`PgPool`]; tests substitute an
//! in-memory implementation.

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::pg::{PgPool, PgPoolConfig, PgResult, PoolEvent, PooledConnection, QueryResult, Value};

/// Builds pools.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Pool: DatabasePool;

    async fn connect(&self, config: &PgPoolConfig) -> PgResult<Self::Pool>;
}

/// A pool of connections. Acquired connections go back to the pool when
/// dropped.
#[async_trait]
pub trait DatabasePool: Send + Sync + 'static {
    type Connection: DatabaseConnection;

    async fn acquire(&self) -> PgResult<Self::Connection>;

    async fn close(&self) -> PgResult<()>;

    /// Receiver for asynchronous pool events; `Some` on the first call only.
    fn take_events(&self) -> Option<UnboundedReceiver<PoolEvent>>;
}

/// One checked-out connection.
#[async_trait]
pub trait DatabaseConnection: Send {
    async fn query(&mut self, statement: &str, params: &[Value]) -> PgResult<QueryResult>;
}

/// Connects [`PgPool`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
    type Pool = PgPool;

    async fn connect(&self, config: &PgPoolConfig) -> PgResult<PgPool> {
        PgPool::connect(config.clone()).await
    }
}

#[async_trait]
impl DatabasePool for PgPool {
    type Connection = PooledConnection;

    async fn acquire(&self) -> PgResult<PooledConnection> {
        PgPool::acquire(self).await
    }

    async fn close(&self) -> PgResult<()> {
        PgPool::close(self).await;
        Ok(())
    }

    fn take_events(&self) -> Option<UnboundedReceiver<PoolEvent>> {
        PgPool::take_events(self)
    }
}

#[async_trait]
impl DatabaseConnection for PooledConnection {
    async fn query(&mut self, statement: &str, params: &[Value]) -> PgResult<QueryResult> {
        PooledConnection::query(self, statement, params).await
    }
}
