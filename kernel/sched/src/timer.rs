//! Per-CPU preemption timer.
//!
//! Each CPU's one-shot timer is re-armed whenever a process is installed as
//! current. Expiry is a forced yield: the handler disarms the timer and
//! calls [`Kernel::sched`] with `Runnable` on behalf of whatever was
//! interrupted.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::kernel::{Cpu, Kernel};
use crate::platform::Platform;
use crate::process::ProcState;

/// Armed flag and deadline of one CPU's timer.
pub(crate) struct PreemptTimer {
    armed: AtomicBool,
    deadline: AtomicU64,
}

impl PreemptTimer {
    pub(crate) const fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            deadline: AtomicU64::new(0),
        }
    }

    pub(crate) fn arm(&self, deadline: u64) {
        self.deadline.store(deadline, Ordering::Relaxed);
        self.armed.store(true, Ordering::Release);
    }

    /// Clears the armed flag, returning whether it was set.
    pub(crate) fn disarm(&self) -> bool {
        self.armed.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub(crate) fn deadline(&self) -> u64 {
        self.deadline.load(Ordering::Relaxed)
    }
}

impl<P: Platform> Kernel<P> {
    /// Starts a fresh quantum on `cpu`.
    pub(crate) fn arm_preempt_timer(&self, cpu: &Cpu<P>) {
        let deadline = self.platform().now().saturating_add(self.config().quantum);
        cpu.timer.arm(deadline);
        self.platform().arm_timer(cpu.id, deadline);
    }

    /// Preemption timer expiry handler, called from the trap layer on the
    /// CPU whose timer fired.
    ///
    /// A stale expiry on a CPU whose timer is no longer armed is ignored.
    pub fn on_timer_interrupt(&self) {
        let cpu = self.this_cpu();
        if !cpu.timer.disarm() {
            return;
        }
        let ready = self.lock_sched();
        self.sched(ready, ProcState::Runnable);
    }
}
