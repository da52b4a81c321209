//! Priority-aware mutual exclusion for the render primitive
//!
//! Every access to the document and its page handles goes through one lock.
//! A prefetch holder is admitted only while no foreground holder is waiting
//! and no foreground job is outstanding (see [`PriorityLock::raise_demand`]),
//! so a visible page waits for at most the one decode already in progress.
//! Prefetch jobs shut out by demand alone give their worker back
//! ([`PriorityLock::lock_or_yield`]) rather than sleep on it.

use crate::JobPriority;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Gate {
    held: bool,

    /// Foreground callers blocked in `lock`
    foreground_waiting: usize,

    /// Foreground jobs queued or running that will need the lock
    foreground_demand: usize,
}

impl Gate {
    fn admits(&self, foreground: bool) -> bool {
        !self.held
            && (foreground || (self.foreground_waiting == 0 && self.foreground_demand == 0))
    }

    /// Free, with no foreground caller waiting, yet closed to prefetch.
    fn only_demand_blocks(&self) -> bool {
        !self.held && self.foreground_waiting == 0 && self.foreground_demand > 0
    }
}

/// Mutex whose waiters are admitted by [`JobPriority`].
///
/// # Example
///
/// ```
/// use folio_scheduler::{JobPriority, PriorityLock};
///
/// let lock = PriorityLock::new(Vec::new());
/// lock.lock(JobPriority::Foreground).push(5);
/// lock.lock(JobPriority::Prefetch).push(6);
///
/// assert_eq!(*lock.lock(JobPriority::Foreground), vec![5, 6]);
/// ```
pub struct PriorityLock<T> {
    gate: Mutex<Gate>,
    released: Condvar,
    data: Mutex<T>,
}

impl<T> PriorityLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            gate: Mutex::new(Gate::default()),
            released: Condvar::new(),
            data: Mutex::new(value),
        }
    }

    /// Block until the lock is available to a holder of `priority`.
    ///
    /// A prefetch caller here waits out outstanding demand; worker threads
    /// use [`lock_or_yield`](Self::lock_or_yield) instead.
    pub fn lock(&self, priority: JobPriority) -> PriorityLockGuard<'_, T> {
        let foreground = AtomicBool::new(priority.is_foreground());
        loop {
            if let Some(guard) = self.acquire(&foreground, false) {
                return guard;
            }
        }
    }

    /// Take the lock with a priority read from `foreground` each time the
    /// waiter is woken.
    ///
    /// A prefetch job promoted while it waits sets the flag and calls
    /// [`raise_demand`](Self::raise_demand), which wakes it as a foreground
    /// waiter.
    ///
    /// Returns `None` when a prefetch waiter finds the lock free but foreground
    /// demand outstanding. The job owning that demand may sit in the queue
    /// behind the caller's own worker, so the caller hands its job back to the
    /// queue instead of parking.
    pub fn lock_or_yield(&self, foreground: &AtomicBool) -> Option<PriorityLockGuard<'_, T>> {
        self.acquire(foreground, true)
    }

    fn acquire(
        &self,
        foreground: &AtomicBool,
        may_yield: bool,
    ) -> Option<PriorityLockGuard<'_, T>> {
        let mut gate = self.gate();
        let counted = foreground.load(Ordering::Acquire);
        if counted {
            gate.foreground_waiting += 1;
        }

        let admitted = loop {
            let is_foreground = foreground.load(Ordering::Acquire);
            if gate.admits(is_foreground) {
                break true;
            }
            if may_yield && !is_foreground && gate.only_demand_blocks() {
                break false;
            }
            gate = self
                .released
                .wait(gate)
                .unwrap_or_else(PoisonError::into_inner);
        };

        if counted {
            gate.foreground_waiting -= 1;
        }
        if !admitted {
            return None;
        }
        gate.held = true;
        drop(gate);

        // The gate admits one holder at a time, so this never contends.
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Some(PriorityLockGuard {
            lock: self,
            data: Some(data),
        })
    }

    /// Register a foreground job that will take the lock later.
    ///
    /// Prefetch holders stay parked until every raise is matched by a
    /// [`lower_demand`](Self::lower_demand).
    pub fn raise_demand(&self) {
        self.gate().foreground_demand += 1;
        self.released.notify_all();
    }

    pub fn lower_demand(&self) {
        let mut gate = self.gate();
        gate.foreground_demand = gate.foreground_demand.saturating_sub(1);
        drop(gate);
        self.released.notify_all();
    }

    pub fn foreground_demand(&self) -> usize {
        self.gate().foreground_demand
    }

    /// Foreground holders currently blocked in [`lock`](Self::lock).
    pub fn foreground_waiting(&self) -> usize {
        self.gate().foreground_waiting
    }

    pub fn is_held(&self) -> bool {
        self.gate().held
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unlock(&self) {
        self.gate().held = false;
        self.released.notify_all();
    }
}

/// Exclusive access to the value inside a [`PriorityLock`].
pub struct PriorityLockGuard<'a, T> {
    lock: &'a PriorityLock<T>,
    data: Option<MutexGuard<'a, T>>,
}

impl<T> Deref for PriorityLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data
            .as_deref()
            .unwrap_or_else(|| unreachable!("guard used after release"))
    }
}

impl<T> DerefMut for PriorityLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("guard used after release"))
    }
}

impl<T> Drop for PriorityLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the data before reopening the gate.
        self.data.take();
        self.lock.unlock();
    }
}
