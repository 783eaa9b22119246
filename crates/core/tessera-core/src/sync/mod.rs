//! Synchronization primitives.
//!
//! - [`SpinLock`]: test-and-test-and-set spin lock with owner tracking,
//!   optionally masking interrupts while held.
//! - [`irq`]: per-CPU interrupt masking with nesting.

pub mod irq;
pub(crate) mod loom_compat;
mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
