//! In-memory pool backend for manager tests.
//!
//! Every statement is answered by a script closure, so tests decide per
//! statement whether it succeeds, fails or takes time. Counters record
//! connects, checkouts, releases, closes, probes and statements.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::backend::{Connector, DatabaseConnection, DatabasePool};
use crate::health::PROBE_STATEMENT;
use crate::pg::protocol::{FieldDescription, Format};
use crate::pg::{Oid, PgError, PgPoolConfig, PgResult, PoolEvent, QueryResult, Row, Value};

pub(crate) struct MockReply {
    pub delay: Duration,
    pub result: PgResult<QueryResult>,
}

impl MockReply {
    pub fn ok() -> Self {
        Self::rows(&[])
    }

    /// A single `value` column with one row per entry.
    pub fn rows(values: &[&str]) -> Self {
        let columns = Arc::new(vec![FieldDescription {
            name: "value".to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: Oid::TEXT,
            type_size: -1,
            type_modifier: -1,
            format: Format::Text,
        }]);
        let rows = values
            .iter()
            .map(|v| {
                let mut row = SmallVec::new();
                row.push(Value::from(*v));
                Row::new(Arc::clone(&columns), row)
            })
            .collect::<Vec<_>>();

        Self {
            delay: Duration::ZERO,
            result: Ok(QueryResult {
                command_tag: format!("SELECT {}", rows.len()),
                columns,
                rows,
            }),
        }
    }

    pub fn err(error: PgError) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err(error),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub(crate) fn server_error(severity: &str, code: &str, message: &str) -> PgError {
    PgError::Server {
        severity: severity.to_string(),
        code: code.to_string(),
        message: message.to_string(),
        detail: None,
        hint: None,
    }
}

pub(crate) fn admin_shutdown() -> PgError {
    server_error(
        "FATAL",
        "57P01",
        "terminating connection due to administrator command",
    )
}

type Script = Arc<dyn Fn(&str) -> MockReply + Send + Sync>;

#[derive(Default)]
pub(crate) struct MockCounters {
    connects: AtomicUsize,
    acquires: AtomicUsize,
    releases: AtomicUsize,
    closes: AtomicUsize,
    probes: AtomicUsize,
    statements: AtomicUsize,
}

impl MockCounters {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
    /// Statements other than the health probe.
    pub fn statements(&self) -> usize {
        self.statements.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub(crate) struct MockConnector {
    pub counters: Arc<MockCounters>,
    script: Script,
    connect_delay: Duration,
    /// Event sender of the most recently created pool.
    events: Arc<Mutex<Option<UnboundedSender<PoolEvent>>>>,
    last_config: Arc<Mutex<Option<PgPoolConfig>>>,
}

impl MockConnector {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&str) -> MockReply + Send + Sync + 'static,
    {
        Self {
            counters: Arc::new(MockCounters::default()),
            script: Arc::new(script),
            connect_delay: Duration::ZERO,
            events: Arc::new(Mutex::new(None)),
            last_config: Arc::new(Mutex::new(None)),
        }
    }

    pub fn healthy() -> Self {
        Self::new(|_| MockReply::ok())
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Raise an asynchronous event on the latest pool.
    pub fn emit(&self, event: PoolEvent) {
        if let Some(sender) = self.events.lock().as_ref() {
            let _ = sender.send(event);
        }
    }

    pub fn last_config(&self) -> Option<PgPoolConfig> {
        self.last_config.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Pool = MockPool;

    async fn connect(&self, config: &PgPoolConfig) -> PgResult<MockPool> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock() = Some(config.clone());
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);

        Ok(MockPool {
            counters: Arc::clone(&self.counters),
            script: Arc::clone(&self.script),
            closed: AtomicBool::new(false),
            events: Mutex::new(Some(rx)),
        })
    }
}

pub(crate) struct MockPool {
    counters: Arc<MockCounters>,
    script: Script,
    closed: AtomicBool,
    events: Mutex<Option<UnboundedReceiver<PoolEvent>>>,
}

#[async_trait]
impl DatabasePool for MockPool {
    type Connection = MockConnection;

    async fn acquire(&self) -> PgResult<MockConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PgError::PoolClosed);
        }
        self.counters.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            counters: Arc::clone(&self.counters),
            script: Arc::clone(&self.script),
        })
    }

    async fn close(&self) -> PgResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn take_events(&self) -> Option<UnboundedReceiver<PoolEvent>> {
        self.events.lock().take()
    }
}

pub(crate) struct MockConnection {
    counters: Arc<MockCounters>,
    script: Script,
}

#[async_trait]
impl DatabaseConnection for MockConnection {
    async fn query(&mut self, statement: &str, _params: &[Value]) -> PgResult<QueryResult> {
        if statement == PROBE_STATEMENT {
            self.counters.probes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.counters.statements.fetch_add(1, Ordering::SeqCst);
        }

        let reply = (self.script)(statement);
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        reply.result
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}
