//! Minimal per-CPU storage and CPU identification.
//!
//! Provides [`CpuLocal`] indexed by the current CPU ID. The ID itself comes
//! from a function registered by the platform with [`set_cpu_id_fn`]
//! (reading `MPIDR_EL1` or a per-CPU register on hardware, a thread-local
//! on host simulations). Before registration every caller is CPU 0.

use core::sync::atomic::{AtomicPtr, Ordering};

use crate::id::CpuId;

/// Maximum supported CPUs.
pub const MAX_CPUS: usize = 256;

/// Per-CPU storage. Wraps `[T; MAX_CPUS]`, indexed by current CPU ID.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Creates a new `CpuLocal` wrapping the given array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns a reference to the current CPU's instance.
    ///
    /// An out-of-range CPU ID falls back to CPU 0's slot rather than
    /// panicking, since this is reached from lock paths that may run before
    /// the platform has registered its CPU-ID source.
    pub fn get(&self) -> &T {
        let id = current_cpu_id().as_usize();
        if id < MAX_CPUS {
            &self.data[id]
        } else {
            &self.data[0]
        }
    }

    /// Returns a reference to a specific CPU's instance.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is not below [`MAX_CPUS`].
    pub fn get_for(&self, cpu: CpuId) -> &T {
        &self.data[cpu.as_usize()]
    }
}

// SAFETY: CpuLocal<T> is designed for per-CPU access. Send/Sync are safe
// because each CPU only accesses its own slot.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send> Sync for CpuLocal<T> {}

// ---------------------------------------------------------------------------
// CPU ID source
// ---------------------------------------------------------------------------

/// The signature of the CPU ID source.
pub type CpuIdFn = fn() -> u32;

fn boot_cpu_id() -> u32 {
    0
}

static CPU_ID_FN: AtomicPtr<()> = AtomicPtr::new(boot_cpu_id as *mut ());

/// Registers the function that reports the calling CPU's ID.
///
/// # Safety
///
/// The provided function must be callable from any context, including
/// interrupt handlers and with any lock held, and must return a value
/// below [`MAX_CPUS`] that is stable for the duration of any critical
/// section on the calling CPU.
pub unsafe fn set_cpu_id_fn(f: CpuIdFn) {
    CPU_ID_FN.store(f as *mut (), Ordering::Release);
}

/// Returns the current CPU ID.
#[inline]
pub fn current_cpu_id() -> CpuId {
    let ptr = CPU_ID_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `CpuIdFn` pointers (or the initial `boot_cpu_id`)
    // are ever stored into CPU_ID_FN.
    let f: CpuIdFn = unsafe { core::mem::transmute(ptr) };
    CpuId::new(f())
}
