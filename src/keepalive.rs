//! Keep-alive task.
//!
//! Managed databases and proxies drop connections that stay idle longer
//! than their idle-session timeout. While a pool exists, this task wakes
//! every `keep_alive_period` and, if nothing has touched the database for
//! longer than `keep_alive_idle_threshold`, runs the health probe so the
//! server sees traffic before it would disconnect.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backend::Connector;
use crate::manager::{PoolManager, Shared};

/// What one keep-alive tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveTick {
    /// Recent activity; no probe needed.
    Skipped,
    /// The pool this task belongs to is gone.
    NoPool,
    /// Probe succeeded.
    Probed,
    /// Probe hit a termination error and the pool was discarded.
    PoolDiscarded,
    /// Probe failed with some other error (logged, not propagated).
    Failed,
}

/// Background tasks tied to one pool instance.
pub(crate) struct PoolTasks {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl PoolTasks {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Ask the tasks to stop without waiting for them.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Stop the tasks and wait until they have exited.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::debug!(error = %e, "pool task ended abnormally");
            }
        }
    }
}

/// One tick: probe pool `pool_id` if the database has been idle too long.
pub(crate) async fn keep_alive_tick<C: Connector>(
    manager: &PoolManager<C>,
    pool_id: u64,
) -> KeepAliveTick {
    let idle_for = manager.idle_for();
    if idle_for <= manager.config().keep_alive_idle_threshold {
        return KeepAliveTick::Skipped;
    }

    let Some(handle) = manager.current().filter(|h| h.id() == pool_id) else {
        return KeepAliveTick::NoPool;
    };

    match manager.check_health(&handle).await {
        Ok(true) => KeepAliveTick::Probed,
        Ok(false) => KeepAliveTick::PoolDiscarded,
        Err(e) => {
            tracing::debug!(pool_id, error = %e, "keep-alive probe failed");
            KeepAliveTick::Failed
        }
    }
}

pub(crate) async fn run_keep_alive<C: Connector>(
    shared: Weak<Shared<C>>,
    pool_id: u64,
    token: CancellationToken,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(manager) = PoolManager::upgrade(&shared) else {
            break;
        };
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            outcome = keep_alive_tick(&manager, pool_id) => outcome,
        };
        tracing::trace!(pool_id, ?outcome, "keep-alive tick");

        if matches!(outcome, KeepAliveTick::NoPool | KeepAliveTick::PoolDiscarded) {
            break;
        }
    }

    tracing::debug!(pool_id, "keep-alive task stopped");
}
