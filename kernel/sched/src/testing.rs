//! Host platform for tests.
//!
//! Simulated CPUs are OS threads. Every context owns a baton; a thread runs
//! kernel code only while it holds its baton, and a switch hands the next
//! context's baton over together with the simulated CPU id, then blocks
//! until its own comes back. A context switched to for the first time
//! spawns its thread, which enters the trampoline.
//!
//! Pages and blocks are fake addresses that are never dereferenced; the
//! allocator only counts them and can be told to fail.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tessera_core::cpu_local::set_cpu_id_fn;
use tessera_core::id::CpuId;

use crate::Kernel;
use crate::config::KernelConfig;
use crate::platform::{
    AddressSpaces, BlockHandle, FrameAllocator, PAGE_SIZE, PageHandle, Platform, StackLayout,
    Trampoline,
};
use crate::process::{ProcState, Process};
use crate::semaphore::Semaphore;

// ---------------------------------------------------------------------------
// Simulated CPU identity
// ---------------------------------------------------------------------------

std::thread_local! {
    static CPU: Cell<u32> = const { Cell::new(0) };
}

fn host_cpu_id() -> u32 {
    CPU.with(Cell::get)
}

/// Makes the calling thread act as CPU `id`.
pub(crate) fn pin_cpu(id: u32) {
    // SAFETY: `host_cpu_id` only reads a thread-local.
    unsafe { set_cpu_id_fn(host_cpu_id) };
    CPU.with(|c| c.set(id));
}

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Baton {
    cpu: Mutex<Option<u32>>,
    cv: Condvar,
}

impl Baton {
    fn give(&self, cpu: u32) {
        *self.cpu.lock().unwrap() = Some(cpu);
        self.cv.notify_one();
    }

    fn wait(&self) -> u32 {
        let mut slot = self.cpu.lock().unwrap();
        loop {
            if let Some(cpu) = slot.take() {
                return cpu;
            }
            slot = self.cv.wait(slot).unwrap();
        }
    }
}

/// Saved "context" of a host process: its baton, plus the trampoline until
/// the first switch-in.
#[derive(Default)]
pub(crate) struct HostContext {
    baton: Arc<Baton>,
    start: Mutex<Option<Trampoline>>,
}

/// Address space handle.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct HostSpace(u32);

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

pub(crate) struct HostPlatform {
    clock: AtomicU64,
    next_addr: AtomicUsize,
    next_space: AtomicU32,
    pages: AtomicUsize,
    blocks: AtomicUsize,
    spaces: AtomicUsize,
    fail_pages: AtomicBool,
    fail_blocks: AtomicBool,
    fail_spaces: AtomicBool,
    switches: AtomicUsize,
    last_timer: Mutex<Option<(CpuId, u64)>>,
    activations: Mutex<Vec<Option<u32>>>,
}

impl HostPlatform {
    pub(crate) fn new() -> Self {
        Self {
            clock: AtomicU64::new(0),
            next_addr: AtomicUsize::new(0x4000_0000),
            next_space: AtomicU32::new(1),
            pages: AtomicUsize::new(0),
            blocks: AtomicUsize::new(0),
            spaces: AtomicUsize::new(0),
            fail_pages: AtomicBool::new(false),
            fail_blocks: AtomicBool::new(false),
            fail_spaces: AtomicBool::new(false),
            switches: AtomicUsize::new(0),
            last_timer: Mutex::new(None),
            activations: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn live_pages(&self) -> usize {
        self.pages.load(Ordering::SeqCst)
    }

    pub(crate) fn live_blocks(&self) -> usize {
        self.blocks.load(Ordering::SeqCst)
    }

    pub(crate) fn live_spaces(&self) -> usize {
        self.spaces.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_pages(&self, fail: bool) {
        self.fail_pages.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_blocks(&self, fail: bool) {
        self.fail_blocks.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_spaces(&self, fail: bool) {
        self.fail_spaces.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn switches(&self) -> usize {
        self.switches.load(Ordering::SeqCst)
    }

    pub(crate) fn last_timer(&self) -> Option<(CpuId, u64)> {
        *self.last_timer.lock().unwrap()
    }

    /// Address spaces installed so far, `None` standing for kernel-only.
    pub(crate) fn activations(&self) -> Vec<Option<u32>> {
        self.activations.lock().unwrap().clone()
    }

    fn fresh_addr(&self, size: usize) -> usize {
        self.next_addr
            .fetch_add(size.next_multiple_of(PAGE_SIZE), Ordering::SeqCst)
    }
}

impl FrameAllocator for HostPlatform {
    fn allocate_page(&self) -> Option<PageHandle> {
        if self.fail_pages.load(Ordering::SeqCst) {
            return None;
        }
        self.pages.fetch_add(1, Ordering::SeqCst);
        Some(PageHandle::new(self.fresh_addr(PAGE_SIZE)))
    }

    fn free_page(&self, _page: PageHandle) {
        self.pages.fetch_sub(1, Ordering::SeqCst);
    }

    fn allocate_block(&self, size: usize) -> Option<BlockHandle> {
        if self.fail_blocks.load(Ordering::SeqCst) {
            return None;
        }
        self.blocks.fetch_add(1, Ordering::SeqCst);
        Some(BlockHandle::new(self.fresh_addr(size), size))
    }

    fn free_block(&self, _block: BlockHandle) {
        self.blocks.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AddressSpaces for HostPlatform {
    type Space = HostSpace;

    fn new_address_space(&self) -> Option<HostSpace> {
        if self.fail_spaces.load(Ordering::SeqCst) {
            return None;
        }
        self.spaces.fetch_add(1, Ordering::SeqCst);
        Some(HostSpace(self.next_space.fetch_add(1, Ordering::SeqCst)))
    }

    fn destroy_address_space(&self, _space: HostSpace) {
        self.spaces.fetch_sub(1, Ordering::SeqCst);
    }

    fn activate_address_space(&self, space: Option<&HostSpace>) {
        self.activations.lock().unwrap().push(space.map(|s| s.0));
    }
}

impl Platform for HostPlatform {
    type Context = HostContext;

    const TRAP_FRAME_SIZE: usize = 288;
    const CONTEXT_FRAME_SIZE: usize = 112;

    fn now(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn arm_timer(&self, cpu: CpuId, deadline: u64) {
        *self.last_timer.lock().unwrap() = Some((cpu, deadline));
    }

    fn prepare_context(&self, ctx: &mut HostContext, _stack: &StackLayout, start: Trampoline) {
        *ctx.start.get_mut().unwrap() = Some(start);
    }

    unsafe fn switch(&self, from: *mut HostContext, to: *const HostContext) {
        self.switches.fetch_add(1, Ordering::SeqCst);
        // SAFETY: The caller keeps both contexts alive across the switch.
        let (from, to) = unsafe { (&*from, &*to) };
        let mine = Arc::clone(&from.baton);
        let theirs = Arc::clone(&to.baton);

        if let Some(start) = to.start.lock().unwrap().take() {
            let baton = Arc::clone(&theirs);
            thread::Builder::new()
                .name("tessera-proc".into())
                .spawn(move || {
                    pin_cpu(baton.wait());
                    (start.entry)(start.arg);
                })
                .expect("spawn process thread");
        }

        theirs.give(host_cpu_id());
        pin_cpu(mine.wait());
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Boots a kernel with `cpus` simulated CPUs; the calling thread is CPU 0's
/// idle loop.
pub(crate) fn boot(cpus: usize) -> &'static Kernel<HostPlatform> {
    boot_with(KernelConfig::new(cpus))
}

/// Boots a kernel with an explicit configuration.
pub(crate) fn boot_with(config: KernelConfig) -> &'static Kernel<HostPlatform> {
    pin_cpu(0);
    let kernel = Kernel::new(HostPlatform::new(), config).expect("boot host kernel");
    Box::leak(Box::new(kernel))
}

/// Runs the calling CPU's idle loop until `done` is set.
pub(crate) fn run_until(kernel: &'static Kernel<HostPlatform>, done: &AtomicBool) {
    while !done.load(Ordering::Acquire) {
        kernel.yield_now();
        thread::yield_now();
    }
}

/// Starts an idle loop for CPU `id` on a new thread.
pub(crate) fn spawn_cpu(
    kernel: &'static Kernel<HostPlatform>,
    id: u32,
    done: &'static AtomicBool,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("tessera-cpu{id}"))
        .spawn(move || {
            pin_cpu(id);
            run_until(kernel, done);
        })
        .expect("spawn cpu thread")
}

/// Blocks the calling process forever, exiting if it is killed.
pub(crate) fn park(kernel: &'static Kernel<HostPlatform>) -> ! {
    let sem = Semaphore::<HostPlatform>::new(0);
    loop {
        if sem.wait(kernel).is_err() {
            kernel.exit(-1);
        }
    }
}

// ---------------------------------------------------------------------------
// State checks
// ---------------------------------------------------------------------------

/// The only transitions a process may take.
const LEGAL_EDGES: [(ProcState, ProcState); 6] = [
    (ProcState::Unused, ProcState::Runnable),
    (ProcState::Runnable, ProcState::Running),
    (ProcState::Running, ProcState::Runnable),
    (ProcState::Running, ProcState::Sleeping),
    (ProcState::Sleeping, ProcState::Runnable),
    (ProcState::Running, ProcState::Zombie),
];

/// Returns every transition `proc` took outside [`LEGAL_EDGES`].
pub(crate) fn illegal_edges(proc: &Process<HostPlatform>) -> Vec<(ProcState, ProcState)> {
    proc.state_edges()
        .into_iter()
        .filter(|edge| !LEGAL_EDGES.contains(edge))
        .collect()
}
