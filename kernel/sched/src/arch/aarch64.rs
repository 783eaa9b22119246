//! AArch64 kernel context, trap frame and context switch.
//!
//! `tessera_swtch` pushes the callee-saved registers as a [`KernelContext`]
//! on the outgoing stack, stores the stack pointer into the outgoing
//! [`SavedContext`], loads the incoming one and pops. A frame built by
//! [`prepare`] pops into the trampoline with its argument in `x0`.

use core::mem::size_of;

use crate::platform::{StackLayout, Trampoline};
use crate::trap::{self, TrapClass};

/// Registers saved by a kernel context switch, lowest address first.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelContext {
    /// `x19` through `x29`.
    pub x: [u64; 11],
    /// Return address (`x30`).
    pub lr: u64,
    /// First argument register, loaded on resume.
    pub x0: u64,
    /// Second argument register, loaded on resume.
    pub x1: u64,
}

/// Interrupted state saved by the exception vectors.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// `TPIDR_EL0`.
    pub tpidr: u64,
    /// `SP_EL0`.
    pub sp: u64,
    /// `SPSR_EL1`.
    pub spsr: u64,
    /// `ELR_EL1`.
    pub elr: u64,
    /// Link register at the time of the trap.
    pub lr: u64,
    /// Keeps the frame 16-byte aligned.
    pub reserved: u64,
    /// `x0` through `x29`.
    pub x: [u64; 30],
}

const _: () = assert!(size_of::<KernelContext>() == 112);
const _: () = assert!(size_of::<TrapFrame>() == 288);
const _: () = assert!(size_of::<KernelContext>() % 16 == 0);
const _: () = assert!(size_of::<TrapFrame>() % 16 == 0);

/// `SPSR_EL1.M[3:0]` value for EL0 with `SP_EL0`.
const MODE_EL0T: u64 = 0;
const MODE_MASK: u64 = 0xf;

impl trap::TrapFrame for TrapFrame {
    fn from_user(&self) -> bool {
        self.spsr & MODE_MASK == MODE_EL0T
    }

    fn syscall_number(&self) -> usize {
        usize::try_from(self.x[8]).unwrap_or(usize::MAX)
    }

    fn syscall_args(&self) -> [u64; 6] {
        [
            self.x[0], self.x[1], self.x[2], self.x[3], self.x[4], self.x[5],
        ]
    }

    fn set_return_value(&mut self, value: u64) {
        self.x[0] = value;
    }
}

/// `ESR_EL1` fields used to classify exceptions.
pub mod esr {
    /// Exception class shift.
    pub const EC_SHIFT: u32 = 26;
    /// Exception class mask, applied after shifting.
    pub const EC_MASK: u64 = 0x3f;
    /// Instruction-length bit; clear for exceptions synthesized on IRQ entry.
    pub const IL: u64 = 1 << 25;
    /// Unknown reason.
    pub const EC_UNKNOWN: u64 = 0x00;
    /// `SVC` from AArch64.
    pub const EC_SVC64: u64 = 0x15;
    /// Instruction abort from EL0.
    pub const EC_IABORT_EL0: u64 = 0x20;
    /// Instruction abort from EL1.
    pub const EC_IABORT_EL1: u64 = 0x21;
    /// Data abort from EL0.
    pub const EC_DABORT_EL0: u64 = 0x24;
    /// Data abort from EL1.
    pub const EC_DABORT_EL1: u64 = 0x25;
}

/// Decodes `ESR_EL1` and `FAR_EL1` into a [`TrapClass`].
///
/// Interrupts are reported as [`TrapClass::Interrupt`]; the platform turns
/// them into [`TrapClass::Timer`] when the interrupt controller says the
/// preemption timer fired.
pub fn classify(esr: u64, far: u64) -> TrapClass {
    let ec = (esr >> esr::EC_SHIFT) & esr::EC_MASK;
    match ec {
        esr::EC_UNKNOWN if esr & esr::IL == 0 => TrapClass::Interrupt,
        esr::EC_SVC64 => TrapClass::Syscall,
        esr::EC_IABORT_EL0 | esr::EC_IABORT_EL1 | esr::EC_DABORT_EL0 | esr::EC_DABORT_EL1 => {
            TrapClass::Fault {
                address: usize::try_from(far).unwrap_or(usize::MAX),
            }
        }
        _ => TrapClass::Unknown(ec),
    }
}

/// Saved stack pointer of a process that is not running.
#[derive(Debug, Default)]
pub struct SavedContext {
    sp: usize,
}

impl SavedContext {
    /// Returns the saved stack pointer.
    pub fn sp(&self) -> usize {
        self.sp
    }
}

/// Builds the first [`KernelContext`] of a process so that switching to
/// `ctx` enters `start`.
///
/// # Safety
///
/// `stack` must describe a mapped, writable kernel stack owned by the
/// process and not in use.
pub unsafe fn prepare(ctx: &mut SavedContext, stack: &StackLayout, start: Trampoline) {
    let frame = KernelContext {
        lr: start.entry as usize as u64,
        x0: start.arg as u64,
        ..KernelContext::default()
    };
    // SAFETY: The caller guarantees the kernel-context area is writable and
    // the layout keeps it 16-byte aligned.
    unsafe { (stack.kernel_context as *mut KernelContext).write(frame) };
    ctx.sp = stack.kernel_context;
}

#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    ".global tessera_swtch",
    "tessera_swtch:",
    "sub sp, sp, #112",
    "stp x19, x20, [sp, #0]",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp x29, x30, [sp, #80]",
    "stp x0, x1, [sp, #96]",
    "mov x9, sp",
    "str x9, [x0]",
    "mov sp, x1",
    "ldp x19, x20, [sp, #0]",
    "ldp x21, x22, [sp, #16]",
    "ldp x23, x24, [sp, #32]",
    "ldp x25, x26, [sp, #48]",
    "ldp x27, x28, [sp, #64]",
    "ldp x29, x30, [sp, #80]",
    "ldp x0, x1, [sp, #96]",
    "add sp, sp, #112",
    "ret",
);

#[cfg(target_arch = "aarch64")]
unsafe extern "C" {
    fn tessera_swtch(from_sp: *mut usize, to_sp: usize);
}

/// Switches from the calling context to `to`.
///
/// # Safety
///
/// Same contract as [`Platform::switch`](crate::platform::Platform::switch):
/// `from` is the caller's context and `to` holds a stack pointer saved by
/// this function or set by [`prepare`].
#[cfg(target_arch = "aarch64")]
pub unsafe fn switch(from: *mut SavedContext, to: *const SavedContext) {
    // SAFETY: Both pointers are valid per the caller's contract.
    unsafe { tessera_swtch(&raw mut (*from).sp, (*to).sp) };
}
