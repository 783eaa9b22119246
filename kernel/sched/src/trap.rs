//! Hooks for the trap layer.
//!
//! The architecture's exception vectors save a trap frame, classify the
//! trap and hand it to [`Kernel::dispatch_trap`]. On the way back to user
//! mode a killed process is terminated instead of resumed.

use tessera_core::{kfatal, kwarn};

use crate::Kernel;
use crate::platform::Platform;

/// Register state saved on trap entry.
pub trait TrapFrame {
    /// Returns `true` if the trap interrupted user mode.
    fn from_user(&self) -> bool;
    /// Syscall number register.
    fn syscall_number(&self) -> usize;
    /// The six syscall argument registers.
    fn syscall_args(&self) -> [u64; 6];
    /// Writes the syscall result into the return register.
    fn set_return_value(&mut self, value: u64);
}

/// What caused a trap, as decoded by the architecture layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapClass {
    /// The calling CPU's preemption timer fired.
    Timer,
    /// Any other device interrupt.
    Interrupt,
    /// A system call instruction.
    Syscall,
    /// A memory access fault at `address`.
    Fault {
        /// Faulting virtual address.
        address: usize,
    },
    /// An exception the kernel does not understand.
    Unknown(u64),
}

/// Syscall handler: receives the six argument registers, returns the result.
pub type SyscallFn<P> = fn(&Kernel<P>, [u64; 6]) -> u64;

/// Device interrupt handler.
pub type IrqFn<P> = fn(&Kernel<P>);

/// Number of syscall slots.
pub const MAX_SYSCALLS: usize = 64;

/// Syscall and interrupt handlers consulted by [`Kernel::dispatch_trap`].
pub struct TrapTable<P: Platform> {
    syscalls: [Option<SyscallFn<P>>; MAX_SYSCALLS],
    irq: Option<IrqFn<P>>,
}

impl<P: Platform> TrapTable<P> {
    /// Creates a table with no handlers.
    pub const fn new() -> Self {
        Self {
            syscalls: [None; MAX_SYSCALLS],
            irq: None,
        }
    }

    /// Installs `handler` as syscall `nr`.
    ///
    /// # Panics
    ///
    /// Panics if `nr` is not below [`MAX_SYSCALLS`].
    pub fn register_syscall(&mut self, nr: usize, handler: SyscallFn<P>) {
        assert!(nr < MAX_SYSCALLS, "trap: syscall {nr} out of range");
        self.syscalls[nr] = Some(handler);
    }

    /// Installs the device interrupt handler.
    pub fn set_irq_handler(&mut self, handler: IrqFn<P>) {
        self.irq = Some(handler);
    }

    fn syscall(&self, nr: usize) -> Option<SyscallFn<P>> {
        self.syscalls.get(nr).copied().flatten()
    }
}

impl<P: Platform> Default for TrapTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> Kernel<P> {
    /// Handles one classified trap, then applies [`trap_return`](Self::trap_return).
    ///
    /// # Panics
    ///
    /// Faults, unknown exceptions and unregistered syscalls are fatal.
    pub fn dispatch_trap<F: TrapFrame>(&self, frame: &mut F, class: TrapClass, table: &TrapTable<P>) {
        match class {
            TrapClass::Timer => self.on_timer_interrupt(),
            TrapClass::Interrupt => match table.irq {
                Some(handler) => handler(self),
                None => kwarn!("trap: unhandled device interrupt"),
            },
            TrapClass::Syscall => {
                let nr = frame.syscall_number();
                let Some(handler) = table.syscall(nr) else {
                    kfatal!("trap: unknown syscall {nr}");
                    panic!("trap: unknown syscall {nr}");
                };
                let ret = handler(self, frame.syscall_args());
                frame.set_return_value(ret);
            }
            TrapClass::Fault { address } => {
                kfatal!("trap: unhandled fault at {address:#x}");
                panic!("trap: unhandled fault at {address:#x}");
            }
            TrapClass::Unknown(code) => {
                kfatal!("trap: unknown exception class {code:#x}");
                panic!("trap: unknown exception class {code:#x}");
            }
        }
        self.trap_return(frame.from_user());
    }

    /// Called on every return from a trap. A killed process returning to
    /// user mode exits with -1 instead.
    pub fn trap_return(&self, from_user: bool) {
        if !from_user {
            return;
        }
        let me = self.current_process();
        if me.is_killed() {
            drop(me);
            self.exit(-1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::process::ProcState;
    use crate::testing::{self, HostPlatform};

    type K = Kernel<HostPlatform>;

    #[derive(Default)]
    struct Frame {
        user: bool,
        nr: usize,
        args: [u64; 6],
        ret: u64,
    }

    impl TrapFrame for Frame {
        fn from_user(&self) -> bool {
            self.user
        }

        fn syscall_number(&self) -> usize {
            self.nr
        }

        fn syscall_args(&self) -> [u64; 6] {
            self.args
        }

        fn set_return_value(&mut self, value: u64) {
            self.ret = value;
        }
    }

    fn sum(_kernel: &K, args: [u64; 6]) -> u64 {
        args.iter().sum()
    }

    static IRQS: AtomicUsize = AtomicUsize::new(0);

    fn count_irq(_kernel: &K) {
        IRQS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn syscall_result_lands_in_frame() {
        let kernel = testing::boot(1);
        let mut table = TrapTable::new();
        table.register_syscall(5, sum);
        let mut frame = Frame {
            user: true,
            nr: 5,
            args: [1, 2, 3, 4, 5, 6],
            ..Frame::default()
        };
        kernel.dispatch_trap(&mut frame, TrapClass::Syscall, &table);
        assert_eq!(frame.ret, 21);
    }

    #[test]
    fn device_interrupt_reaches_handler() {
        let kernel = testing::boot(1);
        let mut table = TrapTable::new();
        table.set_irq_handler(count_irq);
        let before = IRQS.load(Ordering::Relaxed);
        kernel.dispatch_trap(&mut Frame::default(), TrapClass::Interrupt, &table);
        assert_eq!(IRQS.load(Ordering::Relaxed), before + 1);
    }

    #[test]
    #[should_panic(expected = "unknown syscall 9")]
    fn unregistered_syscall_is_fatal() {
        let kernel = testing::boot(1);
        let mut frame = Frame {
            nr: 9,
            ..Frame::default()
        };
        kernel.dispatch_trap(&mut frame, TrapClass::Syscall, &TrapTable::new());
    }

    #[test]
    #[should_panic(expected = "unhandled fault at 0xdead")]
    fn fault_is_fatal() {
        let kernel = testing::boot(1);
        kernel.dispatch_trap(
            &mut Frame::default(),
            TrapClass::Fault { address: 0xdead },
            &TrapTable::new(),
        );
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn register_out_of_range_panics() {
        TrapTable::<HostPlatform>::new().register_syscall(MAX_SYSCALLS, sum);
    }

    // -----------------------------------------------------------------------
    // Killed processes on trap return
    // -----------------------------------------------------------------------

    static KERNEL_MODE_SURVIVED: AtomicBool = AtomicBool::new(false);

    fn user_loop(kernel: &'static K, _arg: usize) {
        loop {
            // A kernel-mode trap never terminates the process.
            kernel.trap_return(false);
            if kernel.current_process().is_killed() {
                KERNEL_MODE_SURVIVED.store(true, Ordering::Release);
            }
            kernel.trap_return(true);
            kernel.yield_now();
        }
    }

    fn kill_user_loop(kernel: &'static K, arg: usize) {
        // SAFETY: `arg` is the leaked flag created by the test.
        let done = unsafe { &*(arg as *const AtomicBool) };
        let p = kernel.create().unwrap();
        kernel.start(&p, user_loop, 0);
        kernel.yield_now();
        assert_eq!(p.state(), ProcState::Runnable);
        kernel.kill(p.pid()).unwrap();
        assert_eq!(kernel.wait(), Ok((p.pid(), -1)));
        done.store(true, Ordering::Release);
        testing::park(kernel)
    }

    #[test]
    fn killed_process_exits_on_return_to_user() {
        let kernel = testing::boot(1);
        let done: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(false)));
        kernel.start_root(kill_user_loop, core::ptr::from_ref(done) as usize);
        testing::run_until(kernel, done);
        assert!(KERNEL_MODE_SURVIVED.load(Ordering::Acquire));
    }
}
