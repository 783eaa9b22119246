//! Counting semaphore built on the scheduler.
//!
//! `wait` sleeps the calling process through [`Kernel::sched`] until the
//! count is positive; `post` increments it and activates one waiter.
//! Lock order is semaphore lock, then scheduler lock: the waiter takes the
//! scheduler lock before dropping its own so a `post` cannot slip in
//! between queueing and going to sleep.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use tessera_core::sync::SpinLock;

use crate::Kernel;
use crate::error::ProcError;
use crate::platform::Platform;
use crate::process::{ProcState, Process};

struct Inner<P: Platform> {
    count: usize,
    waiters: VecDeque<Arc<Process<P>>>,
}

/// Counting semaphore whose waiters are processes.
pub struct Semaphore<P: Platform> {
    inner: SpinLock<Inner<P>>,
}

impl<P: Platform> Semaphore<P> {
    /// Creates a semaphore whose lock masks interrupts.
    pub fn new(count: usize) -> Self {
        Self::with_irq_safety(count, true)
    }

    /// Creates a semaphore, choosing whether its lock masks interrupts.
    pub fn with_irq_safety(count: usize, irq_safe: bool) -> Self {
        Self {
            inner: SpinLock::with_irq_safety(
                "semaphore",
                Inner {
                    count,
                    waiters: VecDeque::new(),
                },
                irq_safe,
            ),
        }
    }

    /// Returns the current count.
    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    /// Returns the number of processes queued on the semaphore.
    pub fn waiters(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Increments the count and wakes the longest waiter, if any.
    pub fn post(&self, kernel: &Kernel<P>) {
        let mut inner = self.inner.lock();
        inner.count += 1;
        if let Some(waiter) = inner.waiters.pop_front() {
            kernel.activate(&waiter);
        }
    }

    /// Blocks until the count is positive, then decrements it.
    ///
    /// Returns [`ProcError::Killed`] without decrementing if the caller is
    /// killed while the count is zero.
    ///
    /// # Panics
    ///
    /// Panics if called from an idle sentinel, which can never sleep.
    pub fn wait(&self, kernel: &Kernel<P>) -> Result<(), ProcError> {
        let me = kernel.current_process();
        assert!(!me.is_idle(), "semaphore: idle sentinel cannot block");

        let mut inner = self.inner.lock();
        loop {
            if inner.count > 0 {
                inner.count -= 1;
                Self::forget(&mut inner, &me);
                return Ok(());
            }
            if me.is_killed() {
                Self::forget(&mut inner, &me);
                return Err(ProcError::Killed);
            }
            if !inner.waiters.iter().any(|w| Arc::ptr_eq(w, &me)) {
                inner.waiters.push_back(Arc::clone(&me));
            }
            let ready = kernel.lock_sched();
            drop(inner);
            kernel.sched(ready, ProcState::Sleeping);
            inner = self.inner.lock();
        }
    }

    fn forget(inner: &mut Inner<P>, me: &Arc<Process<P>>) {
        inner.waiters.retain(|w| !Arc::ptr_eq(w, me));
    }
}
