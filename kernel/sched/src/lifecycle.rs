//! Process lifecycle: create, start, exit, wait and kill.
//!
//! Lock order is tree lock, then semaphore locks, then the scheduler lock.
//! The tree lock is never taken while only the scheduler lock is held.

use alloc::boxed::Box;
use alloc::sync::Arc;

use tessera_core::id::Pid;
use tessera_core::{kdebug, kfatal};

use crate::error::ProcError;
use crate::kernel::{EntryFn, Kernel};
use crate::platform::{Platform, Trampoline};
use crate::process::{ProcState, Process};
use crate::sched::{StartInfo, proc_entry};

impl<P: Platform> Kernel<P> {
    /// Allocates a new `Unused` process with a fresh pid, a kernel stack and
    /// an address space.
    ///
    /// The record is owned by the process table from here on, but it has no
    /// parent until [`start`](Self::start) or
    /// [`set_parent_to_caller`](Self::set_parent_to_caller).
    pub fn create(&self) -> Result<Arc<Process<P>>, ProcError> {
        let pid = self.tree.lock().alloc_pid()?;
        let proc = Arc::new(Process::allocate(
            self.platform(),
            pid,
            self.config().irq_safe_locks,
        )?);
        self.tree.lock().insert(Arc::clone(&proc));
        kdebug!("proc: created pid {pid}");
        Ok(proc)
    }

    /// Starts `proc` running `entry(kernel, arg)` and returns its pid.
    ///
    /// A process without a parent is attached under the root first.
    ///
    /// # Panics
    ///
    /// Panics if `proc` was already started or is an idle sentinel.
    pub fn start(&'static self, proc: &Arc<Process<P>>, entry: EntryFn<P>, arg: usize) -> Pid {
        let pid = proc.pid();
        assert_eq!(
            proc.state(),
            ProcState::Unused,
            "start: pid {pid} was already started"
        );
        let Some(stack) = proc.stack_layout() else {
            panic!("start: pid {pid} has no kernel stack");
        };

        {
            let mut tree = self.tree.lock();
            if tree.parent(pid).is_none() {
                tree.attach(pid, self.root.pid());
            }
        }

        let info = Box::new(StartInfo {
            kernel: self,
            entry,
            arg,
        });
        let trampoline = Trampoline {
            entry: proc_entry::<P>,
            arg: Box::into_raw(info) as usize,
        };
        // SAFETY: An `Unused` process has never been switched to, so nothing
        // else reads or writes its context.
        let ctx = unsafe { &mut *proc.context_ptr() };
        self.platform().prepare_context(ctx, stack, trampoline);

        self.note_started();
        self.activate(proc);
        pid
    }

    /// Starts the root process.
    pub fn start_root(&'static self, entry: EntryFn<P>, arg: usize) -> Pid {
        let root = Arc::clone(&self.root);
        self.start(&root, entry, arg)
    }

    /// Makes the calling process the parent of `proc`.
    ///
    /// # Panics
    ///
    /// Panics if `proc` already has a parent or the caller is an idle
    /// sentinel.
    pub fn set_parent_to_caller(&self, proc: &Process<P>) {
        let me = self.current_process();
        assert!(!me.is_idle(), "proc: idle sentinel cannot adopt pid {}", proc.pid());
        self.tree.lock().attach(proc.pid(), me.pid());
    }

    /// Terminates the calling process with `code`.
    ///
    /// The parent is signalled, the address space destroyed and all
    /// children handed to the root; the root is signalled once more for each
    /// of them that is already a zombie. The record stays in the table as a
    /// zombie until the parent reaps it.
    ///
    /// # Panics
    ///
    /// Panics if called by an idle sentinel or by the root process.
    pub fn exit(&self, code: i32) -> ! {
        let me = self.current_process();
        let pid = me.pid();
        assert!(!me.is_idle(), "exit: idle sentinel cannot exit");
        assert!(
            !Arc::ptr_eq(&me, &self.root),
            "exit: root process pid {pid} cannot exit"
        );
        self.note_exited();
        me.set_exit_code(code);

        let tree = self.tree.lock();
        let Some(parent) = tree.parent(pid).and_then(|p| tree.get(p)).cloned() else {
            kfatal!("exit: pid {pid} has no parent");
            panic!("exit: pid {pid} is not linked into the tree");
        };
        parent.child_exit().post(self);
        drop(parent);

        self.destroy_current_space(&me);

        let mut tree = tree;
        let orphans = tree.reparent_children(pid, self.root.pid());
        if !orphans.is_empty() {
            let zombies = {
                let _ready = self.lock_sched();
                orphans
                    .iter()
                    .filter(|c| c.state() == ProcState::Zombie)
                    .count()
            };
            for _ in 0..zombies {
                self.root.child_exit().post(self);
            }
            kdebug!(
                "exit: pid {pid} left {} children ({zombies} zombie) to the root",
                orphans.len()
            );
        }
        drop(orphans);

        let ready = self.lock_sched();
        drop(tree);
        drop(me);
        kdebug!("exit: pid {pid} exited with {code}");
        self.sched(ready, ProcState::Zombie);
        unreachable!("exit: zombie pid {pid} was scheduled again");
    }

    /// Waits for a child to exit, reaps it and returns its pid and exit code.
    ///
    /// Fails with [`ProcError::NoChildren`] without blocking if the caller
    /// has no children, and with [`ProcError::Killed`] if the caller is
    /// killed while waiting.
    ///
    /// # Panics
    ///
    /// Panics if the caller was signalled but no zombie child exists.
    pub fn wait(&self) -> Result<(Pid, i32), ProcError> {
        let me = self.current_process();
        if self.tree.lock().children(me.pid()).is_empty() {
            return Err(ProcError::NoChildren);
        }
        me.child_exit().wait(self)?;

        let mut tree = self.tree.lock();
        let zombie = {
            let _ready = self.lock_sched();
            tree.children(me.pid()).iter().copied().find(|&c| {
                tree.get(c)
                    .is_some_and(|p| p.state() == ProcState::Zombie)
            })
        };
        let Some(child) = zombie.and_then(|c| tree.remove(c)) else {
            kfatal!("wait: pid {} signalled without a zombie child", me.pid());
            panic!("wait: pid {} has no zombie child to reap", me.pid());
        };
        drop(tree);

        let code = child.exit_code().unwrap_or_default();
        child.reclaim(self.platform());
        kdebug!("wait: pid {} reaped pid {} ({code})", me.pid(), child.pid());
        Ok((child.pid(), code))
    }

    /// Marks the process `pid` killed and wakes it if it is sleeping.
    ///
    /// The process terminates itself at its next return to user mode or
    /// from its next interrupted blocking call. Fails with
    /// [`ProcError::NotFound`] if `pid` is not in the tree or was never
    /// started, and with [`ProcError::Protected`] for the root, which must
    /// keep running to reap orphans.
    pub fn kill(&self, pid: Pid) -> Result<(), ProcError> {
        if pid == self.root.pid() {
            return Err(ProcError::Protected);
        }
        let tree = self.tree.lock();
        let target = tree
            .find(self.root.pid(), pid)
            .ok_or(ProcError::NotFound)?;
        let mut ready = self.lock_sched();
        if target.state() == ProcState::Unused {
            return Err(ProcError::NotFound);
        }
        target.mark_killed();
        let outcome = self.activate_locked(&mut ready, target);
        kdebug!("kill: pid {pid} marked killed ({outcome:?})");
        Ok(())
    }
}
