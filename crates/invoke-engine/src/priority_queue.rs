//! Priority-ordered staging queue for tasks awaiting dispatch.
//!
//! Ordering is on `(priority, sequence)`: strictly higher priority always
//! wins; ties break in submission order (FIFO). Removal by id is supported
//! for queued-cancellation and is the one operation allowed to be `O(n)`
//! (spec §4.A) — everything else is `O(log n)`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// One entry staged in the queue, carrying just enough to order and later
/// identify it; the scheduler owns the actual task payload separately.
#[derive(Debug, Clone, Eq, PartialEq)]
struct Entry<Id> {
    priority: u8,
    sequence: u64,
    id: Id,
}

impl<Id: Eq> Ord for Entry<Id> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority must compare "greater".
        // Among equal priorities, the *earlier* sequence number must compare
        // "greater" so FIFO order pops first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl<Id: Eq> PartialOrd for Entry<Id> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap-style priority queue keyed by `(priority, sequence)`.
///
/// Cancelled entries are lazily tombstoned in `removed` rather than spliced
/// out of the heap immediately, since `BinaryHeap` has no efficient
/// arbitrary-position removal; `pop_highest` skips over tombstones.
pub struct PriorityQueue<Id> {
    heap: BinaryHeap<Entry<Id>>,
    removed: HashSet<Id>,
}

impl<Id> PriorityQueue<Id>
where
    Id: Clone + Eq + std::hash::Hash,
{
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            removed: HashSet::new(),
        }
    }

    /// Stage an id at the given priority and submission sequence number.
    pub fn push(&mut self, id: Id, priority: u8, sequence: u64) {
        self.heap.push(Entry {
            priority,
            sequence,
            id,
        });
    }

    /// Pop the highest-priority, earliest-submitted, still-live id.
    pub fn pop_highest(&mut self) -> Option<Id> {
        while let Some(entry) = self.heap.pop() {
            if self.removed.remove(&entry.id) {
                continue;
            }
            return Some(entry.id);
        }
        None
    }

    /// Mark `id` removed. Returns `true` if it was still present (i.e. had
    /// not already been popped or removed). `O(n)` in the worst case because
    /// it must confirm presence in the heap, not just tombstone blindly.
    pub fn remove(&mut self, id: &Id) -> bool {
        if self.removed.contains(id) {
            return false;
        }
        let present = self.heap.iter().any(|e| &e.id == id);
        if present {
            self.removed.insert(id.clone());
        }
        present
    }

    /// Number of still-live (non-tombstoned) entries.
    pub fn len(&self) -> usize {
        self.heap.len() - self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain all live ids, in priority order, tombstoning everything.
    pub fn drain_all(&mut self) -> Vec<Id> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(id) = self.pop_highest() {
            out.push(id);
        }
        out
    }
}

impl<Id> Default for PriorityQueue<Id>
where
    Id: Clone + Eq + std::hash::Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_pops_first() {
        let mut q = PriorityQueue::new();
        q.push("low", 10, 0);
        q.push("high", 90, 1);
        q.push("mid", 50, 2);

        assert_eq!(q.pop_highest(), Some("high"));
        assert_eq!(q.pop_highest(), Some("mid"));
        assert_eq!(q.pop_highest(), Some("low"));
        assert_eq!(q.pop_highest(), None);
    }

    #[test]
    fn same_priority_is_fifo() {
        let mut q = PriorityQueue::new();
        q.push("a", 50, 0);
        q.push("b", 50, 1);
        q.push("c", 50, 2);

        assert_eq!(q.pop_highest(), Some("a"));
        assert_eq!(q.pop_highest(), Some("b"));
        assert_eq!(q.pop_highest(), Some("c"));
    }

    #[test]
    fn remove_by_id_skips_on_pop() {
        let mut q = PriorityQueue::new();
        q.push("a", 50, 0);
        q.push("b", 60, 1);
        q.push("c", 40, 2);

        assert!(q.remove(&"b"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_highest(), Some("a"));
        assert_eq!(q.pop_highest(), Some("c"));
        assert_eq!(q.pop_highest(), None);
    }

    #[test]
    fn remove_unknown_id_returns_false() {
        let mut q: PriorityQueue<&str> = PriorityQueue::new();
        q.push("a", 50, 0);
        assert!(!q.remove(&"missing"));
        assert!(q.remove(&"a"));
        assert!(!q.remove(&"a"));
    }

    #[test]
    fn drain_all_empties_in_priority_order() {
        let mut q = PriorityQueue::new();
        q.push("low", 0, 0);
        q.push("high", 100, 1);
        let drained = q.drain_all();
        assert_eq!(drained, vec!["high", "low"]);
        assert!(q.is_empty());
    }
}
