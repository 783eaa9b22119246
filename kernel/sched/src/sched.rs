//! Scheduler core.
//!
//! State transitions, ready-set maintenance, the pick policy and the
//! context-switch protocol. [`Kernel::sched`] is entered with the
//! scheduler lock held by the running process; after a switch the lock is
//! released by whatever code resumes on this CPU: either the `sched` call
//! that the next process is returning from, or [`proc_entry`] for a
//! process running for the first time.

use alloc::boxed::Box;
use alloc::sync::Arc;

use tessera_core::id::Pid;
use tessera_core::sync::SpinLockGuard;
use tessera_core::{kdebug, kfatal, ktrace};

use crate::kernel::{Cpu, EntryFn, Kernel};
use crate::platform::Platform;
use crate::process::{ProcState, Process};
use crate::ready::ReadyQueue;

/// Guard over the ready set, held across a call to [`Kernel::sched`].
pub type SchedGuard<'a, P> = SpinLockGuard<'a, ReadyQueue<Arc<Process<P>>>>;

/// Outcome of [`Kernel::activate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// The process was `Unused` or `Sleeping` and is now queued.
    Activated,
    /// The process was already `Runnable` or `Running`.
    AlreadyActive,
    /// The process is a zombie and cannot run again.
    Rejected,
}

impl<P: Platform> Kernel<P> {
    /// Acquires the scheduler lock for a subsequent [`sched`](Self::sched).
    pub fn lock_sched(&self) -> SchedGuard<'_, P> {
        self.sched.lock()
    }

    /// Makes `proc` schedulable.
    pub fn activate(&self, proc: &Arc<Process<P>>) -> Activation {
        let mut ready = self.lock_sched();
        self.activate_locked(&mut ready, proc)
    }

    pub(crate) fn activate_locked(
        &self,
        ready: &mut ReadyQueue<Arc<Process<P>>>,
        proc: &Arc<Process<P>>,
    ) -> Activation {
        match proc.state() {
            ProcState::Running | ProcState::Runnable => Activation::AlreadyActive,
            ProcState::Zombie => Activation::Rejected,
            ProcState::Sleeping | ProcState::Unused => {
                assert!(!proc.is_idle(), "sched: idle sentinel cannot be activated");
                proc.set_state(ProcState::Runnable);
                ready.insert(proc.ready_key(), Arc::clone(proc));
                kdebug!("sched: activated pid {}", proc.pid());
                Activation::Activated
            }
        }
    }

    /// Gives up the CPU for `this`, which becomes `new_state`, and runs the
    /// next process. Returns once this process is scheduled again, or
    /// immediately if the caller was killed and is not exiting.
    ///
    /// # Panics
    ///
    /// Panics if the caller is not `Running` or the picked process is not
    /// `Runnable`.
    pub fn sched(&self, mut ready: SchedGuard<'_, P>, new_state: ProcState) {
        let cpu = self.this_cpu();
        let this = cpu.current();
        if this.state() != ProcState::Running {
            kfatal!("sched: pid {} entered sched while {}", this.pid(), this.state());
            panic!("sched: pid {} is {}, not running", this.pid(), this.state());
        }
        if this.is_killed() && new_state != ProcState::Zombie {
            return;
        }

        self.requeue(&mut ready, &this, new_state);
        let next = self.pick_next(&mut ready, cpu);
        if !next.is_idle() && next.state() != ProcState::Runnable {
            kfatal!("sched: picked pid {} while {}", next.pid(), next.state());
            panic!("sched: pid {} is {}, not runnable", next.pid(), next.state());
        }
        next.set_state(ProcState::Running);
        cpu.set_current(Arc::clone(&next));
        self.arm_preempt_timer(cpu);

        if Arc::ptr_eq(&this, &next) {
            return;
        }
        ktrace!(
            "sched: cpu {} pid {} ({}) -> pid {}",
            cpu.id,
            this.pid(),
            new_state,
            next.pid()
        );
        self.install_address_space(cpu, &next);

        let from = this.context_ptr();
        let to = next.context_ptr().cast_const();
        drop(this);
        drop(next);
        let lock = ready.leak();
        // SAFETY: `from` is the running process's context and `to` belongs to
        // a process that is not running anywhere: it was just taken out of
        // the ready set, or is this CPU's idle sentinel which only this CPU
        // runs. Both records stay alive while the table or this CPU's
        // `current` slot refers to them.
        unsafe { self.platform().switch(from, to) };
        // SAFETY: The CPU that switched back to us took the scheduler lock
        // and handed it over across the switch.
        unsafe { lock.force_unlock() };
    }

    /// Installs `next`'s address space on `cpu`, or the kernel-only tables
    /// if it has none, unless that space is already active there.
    fn install_address_space(&self, cpu: &Cpu<P>, next: &Process<P>) {
        next.with_address_space(|space| {
            let owner = if space.is_some() { next.pid() } else { Pid::IDLE };
            if cpu.swap_space_owner(owner) != owner {
                self.platform().activate_address_space(space);
            }
        });
    }

    /// Destroys the calling process's address space, first moving this CPU
    /// onto the kernel-only tables if that space is installed.
    pub(crate) fn destroy_current_space(&self, me: &Process<P>) {
        let Some(space) = me.take_address_space() else {
            return;
        };
        if self.this_cpu().swap_space_owner(Pid::IDLE) != Pid::IDLE {
            self.platform().activate_address_space(None);
        }
        self.platform().destroy_address_space(space);
    }

    /// Voluntarily yields the CPU; the caller stays runnable.
    pub fn yield_now(&self) {
        let ready = self.lock_sched();
        self.sched(ready, ProcState::Runnable);
    }

    /// Applies `new_state` to the departing process and keeps the ready set
    /// in step with it.
    fn requeue(
        &self,
        ready: &mut ReadyQueue<Arc<Process<P>>>,
        this: &Arc<Process<P>>,
        new_state: ProcState,
    ) {
        if this.is_idle() {
            return;
        }
        let prev = this.state();
        if prev == ProcState::Running && new_state != ProcState::Running {
            this.set_timestamp(self.platform().now());
        }
        this.set_state(new_state);
        let was_ready = prev == ProcState::Runnable;
        let is_ready = new_state == ProcState::Runnable;
        if is_ready && !was_ready {
            ready.insert(this.ready_key(), Arc::clone(this));
        } else if was_ready && !is_ready {
            ready.remove(&this.ready_key());
        }
    }

    /// Removes and returns the longest-waiting runnable process, or this
    /// CPU's idle sentinel if there is none or the kernel is panicking.
    pub(crate) fn pick_next(
        &self,
        ready: &mut ReadyQueue<Arc<Process<P>>>,
        cpu: &Cpu<P>,
    ) -> Arc<Process<P>> {
        if self.is_panicking() {
            return Arc::clone(&cpu.idle);
        }
        match ready.pop_next() {
            Some((_, next)) => next,
            None => Arc::clone(&cpu.idle),
        }
    }
}

/// What a fresh process needs on its first run.
pub(crate) struct StartInfo<P: Platform> {
    pub(crate) kernel: &'static Kernel<P>,
    pub(crate) entry: EntryFn<P>,
    pub(crate) arg: usize,
}

/// First code a started process runs after being switched to.
///
/// `arg` is a leaked `Box<StartInfo<P>>`.
pub(crate) extern "C" fn proc_entry<P: Platform>(arg: usize) -> ! {
    // SAFETY: `start` leaked exactly this box for this process, and a
    // process is entered through its trampoline only once.
    let start = unsafe { Box::from_raw(arg as *mut StartInfo<P>) };
    let StartInfo { kernel, entry, arg } = *start;
    // SAFETY: `sched` on this CPU leaked the scheduler guard before
    // switching here.
    unsafe { kernel.sched.force_unlock() };

    if kernel.current_process().is_killed() {
        kernel.exit(-1);
    }
    entry(kernel, arg);
    kernel.exit(0)
}
