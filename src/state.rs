//! Shared pool slot.

use std::ops::Deref;
use std::sync::Arc;

use tokio::time::Instant;

use crate::keepalive::PoolTasks;

/// A pool instance plus the identity the manager uses to tell rebuilt pools
/// apart. Cheap to clone.
pub struct PoolHandle<P> {
    id: u64,
    pool: Arc<P>,
    created_at: Instant,
}

impl<P> PoolHandle<P> {
    pub(crate) fn new(id: u64, pool: P) -> Self {
        Self {
            id,
            pool: Arc::new(pool),
            created_at: Instant::now(),
        }
    }

    /// Monotonic instance number; a rebuilt pool always has a larger id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }
}

impl<P> Clone for PoolHandle<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            pool: Arc::clone(&self.pool),
            created_at: self.created_at,
        }
    }
}

impl<P> Deref for PoolHandle<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.pool
    }
}

impl<P> std::fmt::Debug for PoolHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle").field("id", &self.id).finish()
    }
}

/// Mutable manager state. Always accessed under one lock, never across an
/// await point.
pub(crate) struct PoolState<P> {
    /// Absent, or the live pool. A pool known to be terminated is never here.
    pub slot: Option<PoolHandle<P>>,
    /// Background tasks belonging to the pool in `slot`.
    pub tasks: Option<PoolTasks>,
    pub last_activity: Instant,
    next_id: u64,
}

impl<P> PoolState<P> {
    pub fn new() -> Self {
        Self {
            slot: None,
            tasks: None,
            last_activity: Instant::now(),
            next_id: 1,
        }
    }

    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Remove the pool if it is still instance `id`, returning it and its
    /// tasks. A stale id leaves a newer pool untouched.
    pub fn take_if(&mut self, id: u64) -> Option<(PoolHandle<P>, Option<PoolTasks>)> {
        if self.slot.as_ref().map(PoolHandle::id) != Some(id) {
            return None;
        }
        let handle = self.slot.take()?;
        Some((handle, self.tasks.take()))
    }

    /// Remove whatever pool is present.
    pub fn take(&mut self) -> Option<(PoolHandle<P>, Option<PoolTasks>)> {
        let handle = self.slot.take()?;
        Some((handle, self.tasks.take()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_if_ignores_stale_id() {
        let mut state = PoolState::new();
        let first = state.allocate_id();
        let second = state.allocate_id();
        assert!(second > first);

        state.slot = Some(PoolHandle::new(second, "pool"));

        assert!(state.take_if(first).is_none());
        assert!(state.slot.is_some());

        let (handle, tasks) = state.take_if(second).unwrap();
        assert_eq!(handle.id(), second);
        assert_eq!(*handle.pool(), "pool");
        assert!(tasks.is_none());
        assert!(state.slot.is_none());
        assert!(state.take().is_none());
    }
}
