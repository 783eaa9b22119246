//! Process lifecycle and CPU scheduling for the Tessera kernel.
//!
//! A [`Kernel`] owns the process table, the global ready set and one
//! record per CPU. Processes are created with [`Kernel::create`], started
//! with [`Kernel::start`], and leave the system through [`Kernel::exit`]
//! and their parent's [`Kernel::wait`]. Scheduling picks the runnable
//! process that has waited longest since it last ran; a per-CPU timer
//! bounds every run to one quantum.
//!
//! Hardware is reached only through the [`Platform`] trait. Everything
//! above it is host-testable: the test suite runs the real scheduler on a
//! thread-backed platform.
//!
//! Lock order: tree lock, then semaphore locks, then the scheduler lock.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod debug;
pub mod error;
pub mod kernel;
mod lifecycle;
pub mod platform;
pub mod process;
pub mod ready;
pub mod sched;
pub mod semaphore;
mod table;
mod timer;
pub mod trap;

#[cfg(test)]
pub(crate) mod testing;

pub use config::KernelConfig;
pub use error::{BootError, ConfigError, ProcError};
pub use kernel::{EntryFn, Kernel};
pub use platform::Platform;
pub use process::{ProcState, Process};
pub use sched::{Activation, SchedGuard};
pub use semaphore::Semaphore;
pub use trap::{TrapClass, TrapFrame, TrapTable};
