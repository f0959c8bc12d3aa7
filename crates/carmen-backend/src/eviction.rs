use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A policy selecting which page-pool slot to evict next.
///
/// The pool reports slot activity through `read`/`written`/`removed`; the
/// policy answers eviction requests with a slot or `None` if it tracks no
/// candidates.
pub trait EvictionPolicy {
    fn read(&mut self, slot: usize);
    fn written(&mut self, slot: usize);
    fn removed(&mut self, slot: usize);
    fn next_eviction(&mut self) -> Option<usize>;
}

const NIL: u32 = u32::MAX;

#[derive(Clone, Copy)]
struct LruNode {
    pred: u32,
    succ: u32,
    linked: bool,
}

/// Least-recently-used eviction. Slots form a doubly linked list in usage
/// order, realized as an arena of u32 links indexed by slot.
pub struct LruPolicy {
    nodes: Vec<LruNode>,
    head: u32,
    tail: u32,
}

impl LruPolicy {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: vec![LruNode { pred: NIL, succ: NIL, linked: false }; capacity],
            head: NIL,
            tail: NIL,
        }
    }

    fn ensure_slot(&mut self, slot: usize) {
        if slot >= self.nodes.len() {
            self.nodes.resize(slot + 1, LruNode { pred: NIL, succ: NIL, linked: false });
        }
    }

    fn unlink(&mut self, slot: usize) {
        let node = self.nodes[slot];
        if !node.linked {
            return;
        }
        if node.pred != NIL {
            self.nodes[node.pred as usize].succ = node.succ;
        } else {
            self.head = node.succ;
        }
        if node.succ != NIL {
            self.nodes[node.succ as usize].pred = node.pred;
        } else {
            self.tail = node.pred;
        }
        self.nodes[slot] = LruNode { pred: NIL, succ: NIL, linked: false };
    }

    fn push_front(&mut self, slot: usize) {
        self.nodes[slot] = LruNode { pred: NIL, succ: self.head, linked: true };
        if self.head != NIL {
            self.nodes[self.head as usize].pred = slot as u32;
        }
        self.head = slot as u32;
        if self.tail == NIL {
            self.tail = slot as u32;
        }
    }
}

impl EvictionPolicy for LruPolicy {
    fn read(&mut self, slot: usize) {
        self.ensure_slot(slot);
        if self.head == slot as u32 {
            return;
        }
        self.unlink(slot);
        self.push_front(slot);
    }

    fn written(&mut self, slot: usize) {
        // Reads and writes are equivalent usage signals for LRU.
        self.read(slot);
    }

    fn removed(&mut self, slot: usize) {
        self.ensure_slot(slot);
        self.unlink(slot);
    }

    fn next_eviction(&mut self) -> Option<usize> {
        if self.tail == NIL {
            None
        } else {
            Some(self.tail as usize)
        }
    }
}

/// Random eviction preferring clean slots. Slots are grouped into clean and
/// dirty sets; eviction samples a uniform position and picks the first set
/// element at or above it, wrapping around. Clean slots are consulted first.
pub struct RandomPolicy {
    clean: BTreeSet<usize>,
    dirty: BTreeSet<usize>,
    capacity: usize,
    rng: StdRng,
}

impl RandomPolicy {
    pub fn new(capacity: usize) -> Self {
        Self::with_seed(capacity, rand::thread_rng().gen())
    }

    /// Seeded variant for deterministic tests.
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self {
            clean: BTreeSet::new(),
            dirty: BTreeSet::new(),
            capacity: capacity.max(1),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn pick(&mut self, set: &BTreeSet<usize>) -> Option<usize> {
        let position = self.rng.gen_range(0..self.capacity);
        set.range(position..)
            .next()
            .or_else(|| set.iter().next())
            .copied()
    }
}

impl EvictionPolicy for RandomPolicy {
    fn read(&mut self, slot: usize) {
        if !self.dirty.contains(&slot) {
            self.clean.insert(slot);
        }
    }

    fn written(&mut self, slot: usize) {
        self.clean.remove(&slot);
        self.dirty.insert(slot);
    }

    fn removed(&mut self, slot: usize) {
        self.clean.remove(&slot);
        self.dirty.remove(&slot);
    }

    fn next_eviction(&mut self) -> Option<usize> {
        if !self.clean.is_empty() {
            let clean = std::mem::take(&mut self.clean);
            let result = self.pick(&clean);
            self.clean = clean;
            return result;
        }
        if !self.dirty.is_empty() {
            let dirty = std::mem::take(&mut self.dirty);
            let result = self.pick(&dirty);
            self.dirty = dirty;
            return result;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_empty_has_no_candidate() {
        let mut policy = LruPolicy::new(3);
        assert_eq!(policy.next_eviction(), None);
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut policy = LruPolicy::new(5);
        policy.read(1);
        policy.read(2);
        policy.read(3);
        assert_eq!(policy.next_eviction(), Some(1));

        // Touching slot 1 promotes it; slot 2 becomes the oldest.
        policy.read(1);
        assert_eq!(policy.next_eviction(), Some(2));

        // Simulate the pool evicting slot 2 and reusing it for a new page.
        policy.removed(2);
        policy.read(4);
        assert_eq!(policy.next_eviction(), Some(3));
    }

    #[test]
    fn test_lru_written_promotes_like_read() {
        let mut policy = LruPolicy::new(4);
        policy.read(0);
        policy.read(1);
        policy.written(0);
        assert_eq!(policy.next_eviction(), Some(1));
    }

    #[test]
    fn test_lru_removed_unlinks() {
        let mut policy = LruPolicy::new(4);
        policy.read(0);
        policy.read(1);
        policy.removed(0);
        assert_eq!(policy.next_eviction(), Some(1));
        policy.removed(1);
        assert_eq!(policy.next_eviction(), None);
    }

    #[test]
    fn test_random_prefers_clean_slots() {
        let mut policy = RandomPolicy::with_seed(8, 42);
        policy.read(0);
        policy.written(1);
        for _ in 0..32 {
            assert_eq!(policy.next_eviction(), Some(0));
        }
        policy.removed(0);
        assert_eq!(policy.next_eviction(), Some(1));
    }

    #[test]
    fn test_random_write_moves_to_dirty() {
        let mut policy = RandomPolicy::with_seed(8, 7);
        policy.read(3);
        policy.written(3);
        // A later read of a dirty slot must not move it back to clean.
        policy.read(3);
        policy.read(5);
        assert_eq!(policy.next_eviction(), Some(5));
    }

    #[test]
    fn test_random_empty_has_no_candidate() {
        let mut policy = RandomPolicy::with_seed(4, 1);
        policy.read(2);
        policy.removed(2);
        assert_eq!(policy.next_eviction(), None);
    }
}
