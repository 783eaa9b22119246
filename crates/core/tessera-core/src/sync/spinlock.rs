//! Spin-based mutual exclusion lock.
//!
//! Uses test-and-test-and-set (TTAS) to reduce cache-line contention and
//! records the owning CPU, so that recursive acquisition and releases from
//! the wrong CPU are caught as fatal errors instead of deadlocking.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use super::irq;
use super::loom_compat::{AtomicBool, AtomicU32, Ordering, spin_loop};
#[cfg(not(loom))]
use crate::cpu_local::current_cpu_id;

/// Owner value while the lock is free.
const NO_OWNER: u32 = u32::MAX;

/// A spin-based mutual exclusion lock.
///
/// An interrupt-safe lock masks interrupts on the acquiring CPU for as long
/// as it is held (see [`irq`](super::irq)); a plain lock leaves them alone.
/// Which one to use is fixed at construction.
pub struct SpinLock<T> {
    locked: AtomicBool,
    owner: AtomicU32,
    irq_safe: bool,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: The SpinLock ensures exclusive access to `T` via atomic operations.
// `T: Send` is required because the data may be accessed from different CPUs.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked `SpinLock` wrapping `value`.
    pub fn new(value: T) -> Self {
        Self::with_irq_safety("<unnamed>", value, false)
    }

    /// Creates a new unlocked `SpinLock` that masks interrupts while held.
    pub fn new_irq_safe(value: T) -> Self {
        Self::with_irq_safety("<unnamed>", value, true)
    }

    /// Creates a new unlocked `SpinLock` with a name for diagnostics.
    pub fn named(name: &'static str, value: T) -> Self {
        Self::with_irq_safety(name, value, false)
    }

    /// Creates a new unlocked `SpinLock` with a name and an explicit
    /// interrupt-masking policy.
    pub fn with_irq_safety(name: &'static str, value: T, irq_safe: bool) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU32::new(NO_OWNER),
            irq_safe,
            name,
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Returns a [`SpinLockGuard`] that releases the lock when dropped.
    ///
    /// # Panics
    ///
    /// Panics if the calling CPU already holds this lock.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        if self.irq_safe {
            irq::push_off();
        }
        self.assert_not_held_here();

        loop {
            // Fast path: try to acquire directly.
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.set_owner();
                return SpinLockGuard::new(self);
            }

            // TTAS: spin on a read (shared cache line) until it looks free.
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `Some(guard)` if the lock was acquired, `None` if it was
    /// already held (including by the calling CPU).
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.irq_safe {
            irq::push_off();
        }
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.set_owner();
            Some(SpinLockGuard::new(self))
        } else {
            if self.irq_safe {
                irq::pop_off();
            }
            None
        }
    }

    /// Returns `true` if some CPU holds the lock.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Returns `true` if the calling CPU holds the lock.
    #[cfg(not(loom))]
    pub fn is_held_by_current_cpu(&self) -> bool {
        self.is_locked() && self.owner.load(Ordering::Relaxed) == current_cpu_id().as_u32()
    }

    /// Returns the diagnostic name given at construction.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns `true` if the lock masks interrupts while held.
    pub fn is_irq_safe(&self) -> bool {
        self.irq_safe
    }

    /// Releases a lock whose guard was given up with [`SpinLockGuard::leak`].
    ///
    /// This is how a lock acquired before a context switch is released by
    /// the code that resumes on the same CPU afterwards.
    ///
    /// # Safety
    ///
    /// The calling CPU must hold the lock and no guard for it may still be
    /// alive; the protected data must not be referenced past this call.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held, or is held by another CPU.
    pub unsafe fn force_unlock(&self) {
        self.release();
    }

    fn release(&self) {
        assert!(
            self.locked.load(Ordering::Relaxed),
            "spinlock `{}`: release of an unlocked lock",
            self.name
        );
        #[cfg(not(loom))]
        {
            let cpu = current_cpu_id().as_u32();
            let owner = self.owner.load(Ordering::Relaxed);
            assert!(
                owner == cpu,
                "spinlock `{}`: released on cpu {cpu} but owned by cpu {owner}",
                self.name
            );
        }
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        if self.irq_safe {
            irq::pop_off();
        }
    }

    #[cfg(not(loom))]
    fn assert_not_held_here(&self) {
        if self.is_held_by_current_cpu() {
            panic!(
                "spinlock `{}`: recursive acquire on cpu {}",
                self.name,
                current_cpu_id()
            );
        }
    }

    // Loom models threads, not CPUs: every loom thread reports CPU 0.
    #[cfg(loom)]
    fn assert_not_held_here(&self) {}

    #[cfg(not(loom))]
    fn set_owner(&self) {
        self.owner
            .store(current_cpu_id().as_u32(), Ordering::Relaxed);
    }

    #[cfg(loom)]
    fn set_owner(&self) {}
}

/// RAII guard that releases the [`SpinLock`] when dropped.
///
/// Not `Send`: the owning CPU is recorded at acquisition.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    fn new(lock: &'a SpinLock<T>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    /// Returns a reference to the underlying [`SpinLock`].
    pub fn lock_ref(&self) -> &'a SpinLock<T> {
        self.lock
    }

    /// Gives up the guard without releasing the lock.
    ///
    /// The lock stays held by the calling CPU until
    /// [`SpinLock::force_unlock`] is called.
    pub fn leak(self) -> &'a SpinLock<T> {
        let lock = self.lock;
        core::mem::forget(self);
        lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
