//! Services the scheduler consumes from the rest of the kernel.
//!
//! Memory, address spaces, the clock, the per-CPU timer and the register
//! level context switch are all provided by the platform. The scheduler
//! itself never touches hardware.

use tessera_core::id::CpuId;

/// Size of one physical page, and of each process's kernel stack.
pub const PAGE_SIZE: usize = 4096;

/// A page handed out by [`FrameAllocator::allocate_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHandle(usize);

impl PageHandle {
    /// Wraps the kernel-visible base address of a page.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the page's base address.
    pub const fn addr(self) -> usize {
        self.0
    }
}

/// A block handed out by [`FrameAllocator::allocate_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    addr: usize,
    size: usize,
}

impl BlockHandle {
    /// Wraps a block's base address and size.
    pub const fn new(addr: usize, size: usize) -> Self {
        Self { addr, size }
    }

    /// Returns the block's base address.
    pub const fn addr(self) -> usize {
        self.addr
    }

    /// Returns the block's size in bytes.
    pub const fn size(self) -> usize {
        self.size
    }
}

/// Page and small-block allocation.
///
/// Failure is reported with `None` and propagated to the caller of
/// process creation.
pub trait FrameAllocator {
    /// Allocates one page.
    fn allocate_page(&self) -> Option<PageHandle>;
    /// Returns a page obtained from [`allocate_page`](Self::allocate_page).
    fn free_page(&self, page: PageHandle);
    /// Allocates a block of at least `size` bytes.
    fn allocate_block(&self, size: usize) -> Option<BlockHandle>;
    /// Returns a block obtained from [`allocate_block`](Self::allocate_block).
    fn free_block(&self, block: BlockHandle);
}

/// Per-process address spaces.
pub trait AddressSpaces {
    /// Handle to one address space, owned by its process.
    type Space: Send;

    /// Builds a fresh address space.
    fn new_address_space(&self) -> Option<Self::Space>;
    /// Tears down an address space when its process exits.
    fn destroy_address_space(&self, space: Self::Space);
    /// Installs `space` on the calling CPU. `None` selects the kernel-only
    /// tables used by idle sentinels and exited processes.
    fn activate_address_space(&self, space: Option<&Self::Space>);
}

/// Where a freshly started process begins executing.
#[derive(Debug, Clone, Copy)]
pub struct Trampoline {
    /// First function run on the new kernel stack.
    pub entry: extern "C" fn(usize) -> !,
    /// Passed to `entry` in the first argument register.
    pub arg: usize,
}

/// Placement of the save areas on a kernel stack page.
///
/// The trap frame sits at the very top of the page and the kernel context
/// directly below it. The stack proper grows down from the kernel context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackLayout {
    /// Lowest address of the stack page.
    pub base: usize,
    /// One past the highest address of the stack page.
    pub top: usize,
    /// Start of the trap-frame save area.
    pub trap_frame: usize,
    /// Start of the kernel-context save area.
    pub kernel_context: usize,
}

impl StackLayout {
    /// Carves the save areas out of `page`.
    ///
    /// # Panics
    ///
    /// Panics if the two areas do not fit in one page.
    pub fn new(page: PageHandle, trap_frame_size: usize, context_size: usize) -> Self {
        assert!(
            trap_frame_size + context_size < PAGE_SIZE,
            "stack layout: {trap_frame_size} + {context_size} bytes exceed a page"
        );
        let base = page.addr();
        let top = base + PAGE_SIZE;
        let trap_frame = top - trap_frame_size;
        let kernel_context = trap_frame - context_size;
        Self {
            base,
            top,
            trap_frame,
            kernel_context,
        }
    }

    /// Stack pointer a new process starts with.
    pub const fn initial_sp(&self) -> usize {
        self.kernel_context
    }
}

/// Everything the scheduler needs from the machine it runs on.
pub trait Platform: FrameAllocator + AddressSpaces + Send + Sync + 'static {
    /// Saved execution state of a process that is not running.
    type Context: Default + Send + Sync;

    /// Bytes reserved at the top of each kernel stack for the trap frame.
    const TRAP_FRAME_SIZE: usize;
    /// Bytes reserved below the trap frame for the kernel context.
    const CONTEXT_FRAME_SIZE: usize;

    /// Monotonic clock in ticks.
    fn now(&self) -> u64;

    /// Programs `cpu`'s one-shot timer to fire at `deadline`.
    fn arm_timer(&self, cpu: CpuId, deadline: u64);

    /// Makes `ctx` resume in `start` on the stack described by `stack` the
    /// first time it is switched to.
    fn prepare_context(&self, ctx: &mut Self::Context, stack: &StackLayout, start: Trampoline);

    /// Saves the calling execution state into `from` and resumes `to`.
    ///
    /// Returns when some CPU later switches back to `from`.
    ///
    /// # Safety
    ///
    /// `from` must be the context of the code calling this function and
    /// `to` a context that was prepared or saved earlier and is not running
    /// anywhere. Both must stay valid until the switch back completes.
    unsafe fn switch(&self, from: *mut Self::Context, to: *const Self::Context);
}
