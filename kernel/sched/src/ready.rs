//! The ready set.
//!
//! Holds every runnable process ordered by when it last stopped running,
//! ties broken by pid, so the minimum is the process that has waited
//! longest. Host-testable and generic over the stored handle.

use alloc::collections::BTreeMap;

use tessera_core::id::Pid;

/// Ordering key of a ready entry: `(timestamp, pid)`, compared in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadyKey {
    /// Time the process last left the CPU.
    pub timestamp: u64,
    /// Tie-break that makes the order strict.
    pub pid: Pid,
}

impl ReadyKey {
    /// Creates a key.
    pub const fn new(timestamp: u64, pid: Pid) -> Self {
        Self { timestamp, pid }
    }
}

/// Ordered set of runnable processes.
pub struct ReadyQueue<T> {
    entries: BTreeMap<ReadyKey, T>,
}

impl<T> ReadyQueue<T> {
    /// Creates an empty ready set.
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Inserts `item` under `key`.
    ///
    /// # Panics
    ///
    /// Panics if `key` is already queued; a process may be ready at most once.
    pub fn insert(&mut self, key: ReadyKey, item: T) {
        if self.entries.insert(key, item).is_some() {
            panic!("ready queue: pid {} queued twice", key.pid);
        }
    }

    /// Removes the entry for `key`, if present.
    pub fn remove(&mut self, key: &ReadyKey) -> Option<T> {
        self.entries.remove(key)
    }

    /// Removes and returns the entry with the smallest key.
    pub fn pop_next(&mut self) -> Option<(ReadyKey, T)> {
        self.entries.pop_first()
    }

    /// Returns the smallest key without removing it.
    pub fn peek_next(&self) -> Option<&ReadyKey> {
        self.entries.keys().next()
    }

    /// Returns `true` if `key` is queued.
    pub fn contains(&self, key: &ReadyKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is runnable.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates in pick order.
    pub fn iter(&self) -> impl Iterator<Item = (&ReadyKey, &T)> {
        self.entries.iter()
    }
}

impl<T> Default for ReadyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(timestamp: u64, pid: u32) -> ReadyKey {
        ReadyKey::new(timestamp, Pid::new(pid))
    }

    #[test]
    fn empty_on_creation() {
        let mut rq = ReadyQueue::<()>::new();
        assert!(rq.is_empty());
        assert_eq!(rq.peek_next(), None);
        assert!(rq.pop_next().is_none());
    }

    #[test]
    fn ties_break_on_pid() {
        let mut rq = ReadyQueue::new();
        rq.insert(key(0, 3), 'c');
        rq.insert(key(0, 1), 'a');
        rq.insert(key(0, 2), 'b');

        assert_eq!(rq.pop_next(), Some((key(0, 1), 'a')));
        assert_eq!(rq.pop_next(), Some((key(0, 2), 'b')));
        assert_eq!(rq.pop_next(), Some((key(0, 3), 'c')));
        assert_eq!(rq.pop_next(), None);
    }

    #[test]
    fn oldest_timestamp_first() {
        let mut rq = ReadyQueue::new();
        rq.insert(key(40, 1), 1);
        rq.insert(key(7, 9), 9);
        rq.insert(key(12, 4), 4);

        assert_eq!(rq.peek_next(), Some(&key(7, 9)));
        let order: Vec<_> = core::iter::from_fn(|| rq.pop_next().map(|(_, v)| v)).collect();
        assert_eq!(order, [9, 4, 1]);
    }

    #[test]
    fn remove_tracks_membership() {
        let mut rq = ReadyQueue::new();
        rq.insert(key(5, 2), ());
        assert!(rq.contains(&key(5, 2)));
        assert_eq!(rq.len(), 1);

        assert_eq!(rq.remove(&key(5, 2)), Some(()));
        assert!(!rq.contains(&key(5, 2)));
        assert_eq!(rq.remove(&key(5, 2)), None);
        assert!(rq.is_empty());
    }

    #[test]
    fn iter_follows_pick_order() {
        let mut rq = ReadyQueue::new();
        rq.insert(key(2, 1), ());
        rq.insert(key(1, 5), ());
        let pids: Vec<_> = rq.iter().map(|(k, ())| k.pid.as_u32()).collect();
        assert_eq!(pids, [5, 1]);
    }

    #[test]
    #[should_panic(expected = "queued twice")]
    fn duplicate_insert_panics() {
        let mut rq = ReadyQueue::new();
        rq.insert(key(0, 1), ());
        rq.insert(key(0, 1), ());
    }
}
