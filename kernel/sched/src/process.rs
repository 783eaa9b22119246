//! Process control records.
//!
//! A [`Process`] is shared as `Arc<Process<P>>`: the process table owns the
//! reference that keeps it alive, while the ready set, semaphore wait
//! lists and per-CPU `current` slots hold transient clones. Mutable fields
//! are atomics whose writers are serialized by the scheduler lock.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU64, Ordering};

use tessera_core::id::Pid;
use tessera_core::ktrace;
use tessera_core::sync::SpinLock;

use crate::error::ProcError;
use crate::platform::{BlockHandle, PageHandle, Platform, StackLayout};
use crate::ready::ReadyKey;
use crate::semaphore::Semaphore;

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcState {
    /// Created but never activated.
    Unused = 0,
    /// In the ready set, waiting for a CPU.
    Runnable = 1,
    /// Current on some CPU.
    Running = 2,
    /// Blocked on a semaphore.
    Sleeping = 3,
    /// Exited, waiting to be reaped by its parent.
    Zombie = 4,
}

impl ProcState {
    /// Returns the state's name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unused => "unused",
            Self::Runnable => "runnable",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Zombie => "zombie",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Unused,
            1 => Self::Runnable,
            2 => Self::Running,
            3 => Self::Sleeping,
            _ => Self::Zombie,
        }
    }
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Memory a process owns until it is reaped.
#[derive(Debug, Clone, Copy)]
struct Memory {
    record: BlockHandle,
    stack: PageHandle,
    layout: StackLayout,
}

/// Saved context storage.
struct ContextCell<C>(UnsafeCell<C>);

// SAFETY: A context is only touched by the CPU switching away from or to its
// process, and every such switch happens with the scheduler lock held.
unsafe impl<C: Send> Sync for ContextCell<C> {}

/// One schedulable unit of execution.
pub struct Process<P: Platform> {
    pid: Pid,
    state: AtomicU8,
    killed: AtomicBool,
    exit_code: AtomicI32,
    timestamp: AtomicU64,
    child_exit: Semaphore<P>,
    memory: Option<Memory>,
    reclaimed: AtomicBool,
    space: SpinLock<Option<P::Space>>,
    context: ContextCell<P::Context>,
    #[cfg(test)]
    edges: std::sync::Mutex<alloc::vec::Vec<(ProcState, ProcState)>>,
}

impl<P: Platform> Process<P> {
    /// Builds an idle sentinel: pid 0, permanently running, no stack.
    pub(crate) fn idle(irq_safe: bool) -> Self {
        Self::with_parts(Pid::IDLE, ProcState::Running, None, None, irq_safe)
    }

    /// Allocates the record charge, kernel stack and address space for a
    /// new process. Anything obtained before a failure is returned to the
    /// platform.
    pub(crate) fn allocate(platform: &P, pid: Pid, irq_safe: bool) -> Result<Self, ProcError> {
        let record = platform
            .allocate_block(size_of::<Self>())
            .ok_or(ProcError::OutOfMemory)?;
        let Some(stack) = platform.allocate_page() else {
            platform.free_block(record);
            return Err(ProcError::OutOfMemory);
        };
        let Some(space) = platform.new_address_space() else {
            platform.free_page(stack);
            platform.free_block(record);
            return Err(ProcError::OutOfMemory);
        };
        let memory = Memory {
            record,
            stack,
            layout: StackLayout::new(stack, P::TRAP_FRAME_SIZE, P::CONTEXT_FRAME_SIZE),
        };
        Ok(Self::with_parts(
            pid,
            ProcState::Unused,
            Some(memory),
            Some(space),
            irq_safe,
        ))
    }

    fn with_parts(
        pid: Pid,
        state: ProcState,
        memory: Option<Memory>,
        space: Option<P::Space>,
        irq_safe: bool,
    ) -> Self {
        Self {
            pid,
            state: AtomicU8::new(state as u8),
            killed: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            timestamp: AtomicU64::new(0),
            child_exit: Semaphore::with_irq_safety(0, irq_safe),
            memory,
            reclaimed: AtomicBool::new(false),
            space: SpinLock::with_irq_safety("proc.space", space, irq_safe),
            context: ContextCell(UnsafeCell::new(P::Context::default())),
            #[cfg(test)]
            edges: std::sync::Mutex::new(alloc::vec::Vec::new()),
        }
    }

    /// Returns the process identifier.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Returns `true` for a per-CPU idle sentinel.
    pub fn is_idle(&self) -> bool {
        self.pid.is_idle()
    }

    /// Returns the current state.
    pub fn state(&self) -> ProcState {
        ProcState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ProcState) {
        #[cfg(test)]
        self.record_edge(state);
        self.state.store(state as u8, Ordering::Release);
    }

    #[cfg(test)]
    fn record_edge(&self, next: ProcState) {
        let prev = self.state();
        if prev != next {
            self.edges.lock().unwrap().push((prev, next));
        }
    }

    /// Every state change so far, oldest first.
    #[cfg(test)]
    pub(crate) fn state_edges(&self) -> alloc::vec::Vec<(ProcState, ProcState)> {
        self.edges.lock().unwrap().clone()
    }

    /// Returns `true` once the process has been killed. Never cleared.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_killed(&self) {
        self.killed.store(true, Ordering::Release);
    }

    /// Returns the exit code, available only once the process is a zombie.
    pub fn exit_code(&self) -> Option<i32> {
        (self.state() == ProcState::Zombie).then(|| self.exit_code.load(Ordering::Acquire))
    }

    pub(crate) fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
    }

    /// Returns when the process last left the CPU (0 if it never ran).
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    pub(crate) fn set_timestamp(&self, now: u64) {
        self.timestamp.store(now, Ordering::Release);
    }

    /// Position of this process in the ready set.
    pub(crate) fn ready_key(&self) -> ReadyKey {
        ReadyKey::new(self.timestamp(), self.pid)
    }

    /// Semaphore posted once per child that becomes a zombie.
    pub fn child_exit(&self) -> &Semaphore<P> {
        &self.child_exit
    }

    /// Layout of the kernel stack. `None` for idle sentinels.
    pub fn stack_layout(&self) -> Option<&StackLayout> {
        self.memory.as_ref().map(|m| &m.layout)
    }

    /// Returns `true` while the process still owns an address space.
    pub fn has_address_space(&self) -> bool {
        self.space.lock().is_some()
    }

    pub(crate) fn with_address_space<R>(&self, f: impl FnOnce(Option<&P::Space>) -> R) -> R {
        f(self.space.lock().as_ref())
    }

    pub(crate) fn take_address_space(&self) -> Option<P::Space> {
        self.space.lock().take()
    }

    pub(crate) fn context_ptr(&self) -> *mut P::Context {
        self.context.0.get()
    }

    /// Returns the kernel stack and record charge to the platform.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub(crate) fn reclaim(&self, platform: &P) {
        assert!(
            !self.reclaimed.swap(true, Ordering::AcqRel),
            "proc: pid {} reclaimed twice",
            self.pid
        );
        if let Some(memory) = self.memory {
            platform.free_page(memory.stack);
            platform.free_block(memory.record);
        }
    }
}

impl<P: Platform> fmt::Debug for Process<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("killed", &self.is_killed())
            .field("timestamp", &self.timestamp())
            .finish_non_exhaustive()
    }
}

impl<P: Platform> Drop for Process<P> {
    fn drop(&mut self) {
        ktrace!("proc: record for pid {} dropped", self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HostPlatform;

    #[test]
    fn state_names_roundtrip() {
        for state in [
            ProcState::Unused,
            ProcState::Runnable,
            ProcState::Running,
            ProcState::Sleeping,
            ProcState::Zombie,
        ] {
            assert_eq!(ProcState::from_u8(state as u8), state);
            assert_eq!(format!("{state}"), state.name());
        }
    }

    #[test]
    fn allocate_starts_unused() {
        let platform = HostPlatform::new();
        let proc = Process::allocate(&platform, Pid::new(4), true).unwrap();
        assert_eq!(proc.pid(), Pid::new(4));
        assert_eq!(proc.state(), ProcState::Unused);
        assert_eq!(proc.timestamp(), 0);
        assert!(!proc.is_killed());
        assert!(proc.has_address_space());
        assert_eq!(proc.exit_code(), None);
        assert_eq!(platform.live_pages(), 1);
        assert_eq!(platform.live_blocks(), 1);
        assert_eq!(platform.live_spaces(), 1);
    }

    #[test]
    fn exit_code_visible_only_as_zombie() {
        let platform = HostPlatform::new();
        let proc = Process::allocate(&platform, Pid::new(2), true).unwrap();
        proc.set_exit_code(7);
        assert_eq!(proc.exit_code(), None);
        proc.set_state(ProcState::Zombie);
        assert_eq!(proc.exit_code(), Some(7));
    }

    #[test]
    fn allocation_failure_releases_partial_resources() {
        let platform = HostPlatform::new();
        platform.fail_spaces(true);
        assert_eq!(
            Process::allocate(&platform, Pid::new(2), true).err(),
            Some(ProcError::OutOfMemory)
        );
        assert_eq!(platform.live_pages(), 0);
        assert_eq!(platform.live_blocks(), 0);

        platform.fail_spaces(false);
        platform.fail_pages(true);
        assert_eq!(
            Process::allocate(&platform, Pid::new(3), true).err(),
            Some(ProcError::OutOfMemory)
        );
        assert_eq!(platform.live_blocks(), 0);
    }

    #[test]
    fn reclaim_frees_stack_and_record() {
        let platform = HostPlatform::new();
        let proc = Process::allocate(&platform, Pid::new(2), true).unwrap();
        proc.reclaim(&platform);
        assert_eq!(platform.live_pages(), 0);
        assert_eq!(platform.live_blocks(), 0);
    }

    #[test]
    #[should_panic(expected = "reclaimed twice")]
    fn double_reclaim_panics() {
        let platform = HostPlatform::new();
        let proc = Process::allocate(&platform, Pid::new(2), true).unwrap();
        proc.reclaim(&platform);
        proc.reclaim(&platform);
    }

    #[test]
    fn state_changes_are_recorded() {
        let platform = HostPlatform::new();
        let proc = Process::allocate(&platform, Pid::new(2), true).unwrap();
        proc.set_state(ProcState::Runnable);
        proc.set_state(ProcState::Runnable);
        proc.set_state(ProcState::Running);
        assert_eq!(
            proc.state_edges(),
            [
                (ProcState::Unused, ProcState::Runnable),
                (ProcState::Runnable, ProcState::Running),
            ]
        );
    }

    #[test]
    fn idle_owns_nothing() {
        let idle = Process::<HostPlatform>::idle(true);
        assert!(idle.is_idle());
        assert_eq!(idle.state(), ProcState::Running);
        assert!(idle.stack_layout().is_none());
        assert!(!idle.has_address_space());
    }
}
