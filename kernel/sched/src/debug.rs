//! Diagnostic dumps of the ready set and the process tree.
//!
//! Snapshots are copied into fixed-capacity buffers under the relevant
//! locks and printed after the locks are dropped, so a slow console never
//! stalls scheduling.

use planck_noalloc::vec::ArrayVec;
use tessera_core::id::Pid;
use tessera_core::kprintln;

use crate::Kernel;
use crate::platform::Platform;
use crate::process::ProcState;

/// Maximum entries captured by one snapshot.
pub const SNAPSHOT_CAPACITY: usize = 32;

/// A bounded copy of a kernel list.
pub struct Snapshot<T> {
    entries: ArrayVec<T, SNAPSHOT_CAPACITY>,
    total: usize,
}

impl<T> Snapshot<T> {
    fn new() -> Self {
        Self {
            entries: ArrayVec::new(),
            total: 0,
        }
    }

    fn push(&mut self, entry: T) {
        self.total += 1;
        if !self.entries.is_full() {
            self.entries.push(entry);
        }
    }

    /// The captured entries, in list order.
    pub fn entries(&self) -> &[T] {
        self.entries.as_slice()
    }

    /// Length of the list when the snapshot was taken.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Entries that did not fit.
    pub fn truncated(&self) -> usize {
        self.total - self.entries.len()
    }
}

/// One ready-set entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEntry {
    /// Queued process.
    pub pid: Pid,
    /// Its ordering timestamp.
    pub timestamp: u64,
}

/// One child of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildEntry {
    /// Child process.
    pub pid: Pid,
    /// Its state at snapshot time.
    pub state: ProcState,
}

impl<P: Platform> Kernel<P> {
    /// Copies the ready set in pick order.
    pub fn ready_snapshot(&self) -> Snapshot<ReadyEntry> {
        let mut snap = Snapshot::new();
        let ready = self.lock_sched();
        for (key, _) in ready.iter() {
            snap.push(ReadyEntry {
                pid: key.pid,
                timestamp: key.timestamp,
            });
        }
        snap
    }

    /// Copies the children of `pid` with their states.
    pub fn children_snapshot(&self, pid: Pid) -> Snapshot<ChildEntry> {
        let mut snap = Snapshot::new();
        let tree = self.tree.lock();
        let _ready = self.lock_sched();
        for &child in tree.children(pid) {
            if let Some(proc) = tree.get(child) {
                snap.push(ChildEntry {
                    pid: child,
                    state: proc.state(),
                });
            }
        }
        snap
    }

    /// Prints the ready set to the console.
    pub fn dump_ready(&self) {
        let snap = self.ready_snapshot();
        kprintln!("ready: {} runnable", snap.total());
        for entry in snap.entries() {
            kprintln!("  pid {:>5}  ts {}", entry.pid, entry.timestamp);
        }
        if snap.truncated() > 0 {
            kprintln!("  ... {} more", snap.truncated());
        }
    }

    /// Prints the children of `pid` to the console.
    pub fn dump_children(&self, pid: Pid) {
        let snap = self.children_snapshot(pid);
        kprintln!("children of pid {pid}: {}", snap.total());
        for entry in snap.entries() {
            kprintln!("  pid {:>5}  {}", entry.pid, entry.state);
        }
        if snap.truncated() > 0 {
            kprintln!("  ... {} more", snap.truncated());
        }
    }
}
