//! Interrupt masking with per-CPU nesting.
//!
//! [`push_off`] masks interrupts and bumps the calling CPU's nesting depth;
//! [`pop_off`] drops it and unmasks only when the outermost section ends
//! and interrupts were enabled when it began. Critical sections may
//! therefore be released in any order, which the scheduler relies on when
//! a semaphore lock is dropped while the scheduler lock is still held.
//!
//! On host targets masking is a no-op but the nesting accounting is kept,
//! so lock discipline remains observable in tests.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;

use crate::cpu_local::{CpuLocal, MAX_CPUS, current_cpu_id};

bitflags! {
    /// AArch64 `DAIF` exception mask bits (set = masked).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Daif: u64 {
        /// Debug exceptions.
        const D = 1 << 9;
        /// SError interrupts.
        const A = 1 << 8;
        /// IRQ interrupts.
        const I = 1 << 7;
        /// FIQ interrupts.
        const F = 1 << 6;
    }
}

impl Daif {
    /// Returns `true` if IRQs are unmasked in this `DAIF` value.
    pub fn irqs_enabled(self) -> bool {
        !self.contains(Self::I)
    }
}

// ---------------------------------------------------------------------------
// Per-CPU nesting state
// ---------------------------------------------------------------------------

struct Nesting {
    depth: AtomicU32,
    enable_on_exit: AtomicBool,
}

impl Nesting {
    const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
            enable_on_exit: AtomicBool::new(false),
        }
    }
}

static NESTING: CpuLocal<Nesting> = CpuLocal::new([const { Nesting::new() }; MAX_CPUS]);

/// Masks interrupts on the calling CPU and enters one nesting level.
pub fn push_off() {
    let was_enabled = save_and_disable();
    let nesting = NESTING.get();
    if nesting.depth.fetch_add(1, Ordering::Relaxed) == 0 {
        nesting.enable_on_exit.store(was_enabled, Ordering::Relaxed);
    }
}

/// Leaves one nesting level, unmasking interrupts when the outermost level
/// ends and they were enabled when it began.
///
/// # Panics
///
/// Panics if the calling CPU has no open nesting level.
pub fn pop_off() {
    let nesting = NESTING.get();
    let prev = nesting
        .depth
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| d.checked_sub(1));
    match prev {
        Ok(1) => {
            if nesting.enable_on_exit.swap(false, Ordering::Relaxed) {
                enable();
            }
        }
        Ok(_) => {}
        Err(_) => panic!(
            "irq: pop_off without matching push_off on cpu {}",
            current_cpu_id()
        ),
    }
}

/// Returns the calling CPU's interrupt-masking nesting depth.
pub fn depth() -> u32 {
    NESTING.get().depth.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Architecture hooks
// ---------------------------------------------------------------------------

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
#[inline]
fn save_and_disable() -> bool {
    let flags: u64;
    // SAFETY: Reading DAIF and masking IRQs is safe at EL1.
    unsafe {
        core::arch::asm!(
            "mrs {}, DAIF",
            "msr DAIFSet, #2",
            out(reg) flags,
            options(nomem, nostack),
        );
    }
    Daif::from_bits_truncate(flags).irqs_enabled()
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
#[inline]
fn enable() {
    // SAFETY: Unmasking IRQs restores the state recorded by `push_off`.
    unsafe {
        core::arch::asm!("msr DAIFClr, #2", options(nomem, nostack));
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn save_and_disable() -> bool {
    let flags: u64;
    // SAFETY: Reading RFLAGS and disabling interrupts is safe in kernel mode.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem),
        );
    }
    flags & (1 << 9) != 0
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn enable() {
    // SAFETY: Re-enabling interrupts restores the state recorded by `push_off`.
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

#[cfg(not(all(target_os = "none", any(target_arch = "aarch64", target_arch = "x86_64"))))]
#[inline]
fn save_and_disable() -> bool {
    false
}

#[cfg(not(all(target_os = "none", any(target_arch = "aarch64", target_arch = "x86_64"))))]
#[inline]
fn enable() {}
