//! Per-device mutual exclusion.
//!
//! [`DeviceLock`] is an async lock that records which task holds it. The
//! holder gets a [`DeviceLockGuard`] that releases on drop, including on
//! panic unwinding. [`DeviceLock::force_release`] exists for the forced-stop
//! path: an aborted task's guard may never run its release, so the manager
//! clears the lock explicitly afterwards. Each acquisition carries a
//! generation number so a stale guard dropped after a forced release cannot
//! release a newer holder's lock.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::tasks::TaskId;

#[derive(Debug, Default)]
struct LockState {
    holder: Option<TaskId>,
    generation: u64,
}

#[derive(Debug, Default)]
struct LockInner {
    state: Mutex<LockState>,
    released: Notify,
}

impl LockInner {
    fn state(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Async mutual-exclusion lock for one device.
#[derive(Debug, Clone, Default)]
pub struct DeviceLock {
    inner: Arc<LockInner>,
}

impl DeviceLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `holder`, waiting while another task holds it.
    pub async fn acquire(&self, holder: TaskId) -> DeviceLockGuard {
        loop {
            let released = self.inner.released.notified();
            if let Some(guard) = self.try_acquire(holder) {
                return guard;
            }
            released.await;
        }
    }

    /// Acquire without waiting.
    #[must_use]
    pub fn try_acquire(&self, holder: TaskId) -> Option<DeviceLockGuard> {
        let mut state = self.inner.state();
        if state.holder.is_some() {
            return None;
        }
        state.generation += 1;
        state.holder = Some(holder);
        Some(DeviceLockGuard {
            inner: Arc::clone(&self.inner),
            holder,
            generation: state.generation,
        })
    }

    /// Current holder, if any.
    #[must_use]
    pub fn holder(&self) -> Option<TaskId> {
        self.inner.state().holder
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.holder().is_some()
    }

    /// Clear the lock regardless of who holds it. Returns the evicted holder.
    pub fn force_release(&self) -> Option<TaskId> {
        let evicted = {
            let mut state = self.inner.state();
            let evicted = state.holder.take();
            state.generation += 1;
            evicted
        };
        self.inner.released.notify_waiters();
        evicted
    }
}

/// Proof of holding a [`DeviceLock`]. Dropping it releases the lock.
#[derive(Debug)]
pub struct DeviceLockGuard {
    inner: Arc<LockInner>,
    holder: TaskId,
    generation: u64,
}

impl DeviceLockGuard {
    #[must_use]
    pub fn holder(&self) -> TaskId {
        self.holder
    }
}

impl Drop for DeviceLockGuard {
    fn drop(&mut self) {
        let released = {
            let mut state = self.inner.state();
            if state.holder == Some(self.holder) && state.generation == self.generation {
                state.holder = None;
                true
            } else {
                false
            }
        };
        if released {
            self.inner.released.notify_waiters();
        }
    }
}
