//! The process table.
//!
//! An arena keyed by pid that owns every process record and stores the
//! parent/children tree as pids, so reparenting never moves ownership.
//! Guarded by the kernel's tree lock, which also serializes pid
//! allocation.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use tessera_core::id::Pid;

use crate::error::ProcError;
use crate::platform::Platform;
use crate::process::Process;

struct Node<P: Platform> {
    proc: Arc<Process<P>>,
    parent: Option<Pid>,
    children: Vec<Pid>,
}

/// Arena of process records plus the parent/children tree.
pub(crate) struct ProcTable<P: Platform> {
    nodes: BTreeMap<Pid, Node<P>>,
    next_pid: u32,
    pid_limit: u32,
}

impl<P: Platform> ProcTable<P> {
    pub(crate) const fn new(pid_limit: u32) -> Self {
        Self {
            nodes: BTreeMap::new(),
            next_pid: 1,
            pid_limit,
        }
    }

    /// Hands out the next pid. Pids are never reused.
    pub(crate) fn alloc_pid(&mut self) -> Result<Pid, ProcError> {
        if self.next_pid > self.pid_limit {
            return Err(ProcError::PidsExhausted);
        }
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        Ok(pid)
    }

    /// Takes ownership of a freshly created record. It has no parent yet.
    pub(crate) fn insert(&mut self, proc: Arc<Process<P>>) {
        let pid = proc.pid();
        let node = Node {
            proc,
            parent: None,
            children: Vec::new(),
        };
        assert!(
            self.nodes.insert(pid, node).is_none(),
            "proc table: pid {pid} inserted twice"
        );
    }

    /// Makes `pid` its own parent.
    pub(crate) fn make_root(&mut self, pid: Pid) {
        self.node_mut(pid).parent = Some(pid);
    }

    pub(crate) fn get(&self, pid: Pid) -> Option<&Arc<Process<P>>> {
        self.nodes.get(&pid).map(|n| &n.proc)
    }

    pub(crate) fn parent(&self, pid: Pid) -> Option<Pid> {
        self.nodes.get(&pid).and_then(|n| n.parent)
    }

    /// Children of `pid`, in the order they were attached.
    pub(crate) fn children(&self, pid: Pid) -> &[Pid] {
        self.nodes.get(&pid).map_or(&[], |n| n.children.as_slice())
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Links `child` under `parent`.
    ///
    /// # Panics
    ///
    /// Panics if either pid is not in the table or `child` already has a
    /// parent.
    pub(crate) fn attach(&mut self, child: Pid, parent: Pid) {
        assert!(
            self.nodes.contains_key(&parent),
            "proc table: parent {parent} of {child} is not in the table"
        );
        let node = self.node_mut(child);
        if let Some(old) = node.parent {
            panic!("proc table: pid {child} already has parent {old}");
        }
        node.parent = Some(parent);
        self.node_mut(parent).children.push(child);
    }

    /// Moves every child of `from` under `to` and returns the moved records.
    pub(crate) fn reparent_children(&mut self, from: Pid, to: Pid) -> Vec<Arc<Process<P>>> {
        let moved = core::mem::take(&mut self.node_mut(from).children);
        let mut procs = Vec::with_capacity(moved.len());
        for &child in &moved {
            let node = self.node_mut(child);
            node.parent = Some(to);
            procs.push(Arc::clone(&node.proc));
        }
        self.node_mut(to).children.extend_from_slice(&moved);
        procs
    }

    /// Unlinks `pid` from its parent and drops the table's ownership.
    ///
    /// # Panics
    ///
    /// Panics if `pid` still has children; they must be reparented first.
    pub(crate) fn remove(&mut self, pid: Pid) -> Option<Arc<Process<P>>> {
        let node = self.nodes.remove(&pid)?;
        assert!(
            node.children.is_empty(),
            "proc table: removing pid {pid} with live children"
        );
        if let Some(parent) = node
            .parent
            .filter(|&p| p != pid)
            .and_then(|p| self.nodes.get_mut(&p))
        {
            parent.children.retain(|&c| c != pid);
        }
        Some(node.proc)
    }

    /// Depth-first search for `pid` in the subtree rooted at `from`.
    pub(crate) fn find(&self, from: Pid, pid: Pid) -> Option<&Arc<Process<P>>> {
        let mut stack = Vec::from([from]);
        while let Some(at) = stack.pop() {
            let node = self.nodes.get(&at)?;
            if at == pid {
                return Some(&node.proc);
            }
            stack.extend(node.children.iter().rev());
        }
        None
    }

    fn node_mut(&mut self, pid: Pid) -> &mut Node<P> {
        match self.nodes.get_mut(&pid) {
            Some(node) => node,
            None => panic!("proc table: pid {pid} is not in the table"),
        }
    }
}
