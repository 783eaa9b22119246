//! The kernel context object.
//!
//! [`Kernel`] owns the process table, the ready set and the per-CPU
//! records. It is built once at boot and never torn down; every operation
//! takes it by reference.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use tessera_core::cpu_local::current_cpu_id;
use tessera_core::id::{CpuId, Pid};
use tessera_core::sync::SpinLock;
use tessera_core::{kinfo, log};

use crate::config::KernelConfig;
use crate::error::BootError;
use crate::platform::Platform;
use crate::process::Process;
use crate::ready::ReadyQueue;
use crate::table::ProcTable;
use crate::timer::PreemptTimer;

/// Function a started process runs. Returning from it exits with code 0.
pub type EntryFn<P> = fn(&'static Kernel<P>, usize);

/// Per-CPU scheduling state.
pub(crate) struct Cpu<P: Platform> {
    pub(crate) id: CpuId,
    pub(crate) idle: Arc<Process<P>>,
    current: UnsafeCell<Arc<Process<P>>>,
    /// Pid owning the installed address space, `Pid::IDLE` for kernel-only.
    space_owner: AtomicU32,
    pub(crate) timer: PreemptTimer,
}

// SAFETY: `current` is only read by its own CPU, and only written by its own
// CPU while holding the scheduler lock.
unsafe impl<P: Platform> Sync for Cpu<P> {}

impl<P: Platform> Cpu<P> {
    fn new(id: CpuId, irq_safe: bool) -> Self {
        let idle = Arc::new(Process::idle(irq_safe));
        Self {
            id,
            current: UnsafeCell::new(Arc::clone(&idle)),
            idle,
            space_owner: AtomicU32::new(Pid::IDLE.as_u32()),
            timer: PreemptTimer::new(),
        }
    }

    pub(crate) fn current(&self) -> Arc<Process<P>> {
        // SAFETY: Only this CPU writes the slot, so no write can overlap.
        unsafe { Arc::clone(&*self.current.get()) }
    }

    pub(crate) fn set_current(&self, proc: Arc<Process<P>>) {
        // SAFETY: Called by this CPU with the scheduler lock held.
        unsafe { *self.current.get() = proc };
    }

    /// Records `owner` as the process whose address space this CPU has
    /// installed and returns the previous owner.
    pub(crate) fn swap_space_owner(&self, owner: Pid) -> Pid {
        Pid::new(self.space_owner.swap(owner.as_u32(), Ordering::Relaxed))
    }
}

/// Process table, scheduler state and platform, initialized once at boot.
pub struct Kernel<P: Platform> {
    platform: P,
    config: KernelConfig,
    pub(crate) tree: SpinLock<ProcTable<P>>,
    pub(crate) sched: SpinLock<ReadyQueue<Arc<Process<P>>>>,
    pub(crate) cpus: Box<[Cpu<P>]>,
    pub(crate) root: Arc<Process<P>>,
    live: AtomicUsize,
    panicking: AtomicBool,
}

impl<P: Platform> Kernel<P> {
    /// Validates `config`, creates the root process and one idle sentinel
    /// per CPU.
    ///
    /// The root is pid 1, its own parent, and stays `Unused` until
    /// [`start_root`](Self::start_root).
    pub fn new(platform: P, config: KernelConfig) -> Result<Self, BootError> {
        config.validate()?;
        log::set_max_level(config.log_level);
        let irq_safe = config.irq_safe_locks;

        let mut table = ProcTable::new(config.pid_limit);
        let pid = table.alloc_pid()?;
        let root = Arc::new(Process::allocate(&platform, pid, irq_safe)?);
        table.insert(Arc::clone(&root));
        table.make_root(pid);

        #[allow(
            clippy::cast_possible_truncation,
            reason = "cpu count is validated against MAX_CPUS"
        )]
        let cpus: Vec<Cpu<P>> = (0..config.cpus)
            .map(|i| Cpu::new(CpuId::new(i as u32), irq_safe))
            .collect();

        kinfo!(
            "sched: {} cpu(s), quantum {} ticks, root pid {}",
            config.cpus,
            config.quantum,
            pid
        );

        Ok(Self {
            platform,
            config,
            tree: SpinLock::with_irq_safety("tree", table, irq_safe),
            sched: SpinLock::with_irq_safety("sched", ReadyQueue::new(), irq_safe),
            cpus: cpus.into_boxed_slice(),
            root,
            live: AtomicUsize::new(0),
            panicking: AtomicBool::new(false),
        })
    }

    /// Returns the platform services.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Returns the boot configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Returns the root process.
    pub fn root(&self) -> &Arc<Process<P>> {
        &self.root
    }

    /// Number of processes started and not yet exited.
    pub fn live_processes(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub(crate) fn note_started(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_exited(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Stops handing out real processes: from now on every CPU picks its
    /// idle sentinel.
    pub fn begin_panic(&self) {
        self.panicking.store(true, Ordering::Release);
    }

    /// Returns `true` once [`begin_panic`](Self::begin_panic) was called.
    pub fn is_panicking(&self) -> bool {
        self.panicking.load(Ordering::Acquire)
    }

    /// Returns the calling CPU's running process (its idle sentinel when
    /// nothing else runs).
    pub fn current_process(&self) -> Arc<Process<P>> {
        self.this_cpu().current()
    }

    /// Looks a process up in the table, started or not.
    pub fn process(&self, pid: Pid) -> Option<Arc<Process<P>>> {
        self.tree.lock().get(pid).cloned()
    }

    /// Returns the parent of `pid`.
    pub fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.tree.lock().parent(pid)
    }

    /// Returns the children of `pid` in attachment order.
    pub fn children_of(&self, pid: Pid) -> Vec<Pid> {
        self.tree.lock().children(pid).to_vec()
    }

    pub(crate) fn this_cpu(&self) -> &Cpu<P> {
        let id = current_cpu_id();
        match self.cpus.get(id.as_usize()) {
            Some(cpu) => cpu,
            None => panic!("sched: cpu {id} is not managed by this kernel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, ProcError};
    use crate::process::ProcState;
    use crate::testing::{self, HostPlatform};

    #[test]
    fn boot_creates_root_and_idles() {
        let kernel = testing::boot(2);
        let root = kernel.root();
        assert_eq!(root.pid(), Pid::new(1));
        assert_eq!(root.state(), ProcState::Unused);
        assert_eq!(kernel.parent_of(root.pid()), Some(root.pid()));
        assert_eq!(kernel.live_processes(), 0);

        assert_eq!(kernel.cpus.len(), 2);
        for (i, cpu) in kernel.cpus.iter().enumerate() {
            assert_eq!(cpu.id.as_usize(), i);
            assert!(cpu.idle.is_idle());
            assert!(Arc::ptr_eq(&cpu.current(), &cpu.idle));
        }
        assert!(kernel.current_process().is_idle());
    }

    #[test]
    fn boot_rejects_invalid_config() {
        let err = Kernel::new(HostPlatform::new(), KernelConfig::new(0)).err();
        assert_eq!(err, Some(BootError::Config(ConfigError::NoCpus)));
    }

    #[test]
    fn boot_fails_without_memory() {
        let platform = HostPlatform::new();
        platform.fail_pages(true);
        let err = Kernel::new(platform, KernelConfig::new(1)).err();
        assert_eq!(err, Some(BootError::Root(ProcError::OutOfMemory)));
    }

    #[test]
    fn lookups_cover_unstarted_processes() {
        let kernel = testing::boot(1);
        let p = kernel.create().unwrap();
        assert!(Arc::ptr_eq(&kernel.process(p.pid()).unwrap(), &p));
        assert_eq!(kernel.parent_of(p.pid()), None);
        assert!(kernel.children_of(kernel.root().pid()).is_empty());
        assert!(kernel.process(Pid::new(42)).is_none());
    }

    #[test]
    fn panic_flag_is_sticky() {
        let kernel = testing::boot(1);
        assert!(!kernel.is_panicking());
        kernel.begin_panic();
        assert!(kernel.is_panicking());
    }
}
