use std::collections::HashMap;

use carmen_crypto::{chain_hash, Hash, ZERO_HASH};
use carmen_types::error::Result;

use super::{key_bytes, Index, IndexKey};

/// An append-only in-memory index.
///
/// Keys live in a hash map plus an insertion-ordered list; the chain hash is
/// folded lazily over keys appended since the last hash request.
pub struct InMemoryIndex<K: IndexKey> {
    data: HashMap<K, u32>,
    keys: Vec<K>,
    next_to_hash: usize,
    hash: Hash,
}

impl<K: IndexKey> InMemoryIndex<K> {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            keys: Vec::new(),
            next_to_hash: 0,
            hash: ZERO_HASH,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Rebuilds an index holding exactly the snapshot's keys, in order.
    pub fn from_snapshot(snapshot: &IndexSnapshot<K>) -> Self {
        let mut index = Self::new();
        for key in &snapshot.keys {
            // Keys in a snapshot are unique by construction.
            let _ = index.get_or_add_internal(key);
        }
        index
    }

    fn get_or_add_internal(&mut self, key: &K) -> (u32, bool) {
        if let Some(&id) = self.data.get(key) {
            return (id, false);
        }
        let id = self.keys.len() as u32;
        self.data.insert(*key, id);
        self.keys.push(*key);
        (id, true)
    }
}

impl<K: IndexKey> Default for InMemoryIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: IndexKey> Index<K> for InMemoryIndex<K> {
    fn get_or_add(&mut self, key: &K) -> Result<(u32, bool)> {
        Ok(self.get_or_add_internal(key))
    }

    fn get(&mut self, key: &K) -> Result<Option<u32>> {
        Ok(self.data.get(key).copied())
    }

    fn get_hash(&mut self) -> Result<Hash> {
        while self.next_to_hash < self.keys.len() {
            let bytes = key_bytes(&self.keys[self.next_to_hash]);
            self.hash = chain_hash(&self.hash, &bytes);
            self.next_to_hash += 1;
        }
        Ok(self.hash)
    }

    /// Captures the current key sequence, detached from future additions.
    fn create_snapshot(&mut self) -> Result<IndexSnapshot<K>> {
        Ok(IndexSnapshot { keys: self.keys.clone() })
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A point-in-time view of an index's key sequence.
pub struct IndexSnapshot<K> {
    keys: Vec<K>,
}

impl<K: Copy> IndexSnapshot<K> {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns the keys in the half-open range `[from, to)`, clamped to the
    /// snapshot size.
    pub fn keys(&self, from: usize, to: usize) -> &[K] {
        let from = from.min(self.keys.len());
        let to = to.clamp(from, self.keys.len());
        &self.keys[from..to]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carmen_types::Address;

    fn address(seed: u8) -> Address {
        Address::new([seed; 20])
    }

    #[test]
    fn test_ids_are_dense_and_stable() {
        let mut index = InMemoryIndex::new();
        assert_eq!(index.get_or_add(&address(1)).unwrap(), (0, true));
        assert_eq!(index.get_or_add(&address(2)).unwrap(), (1, true));
        assert_eq!(index.get_or_add(&address(1)).unwrap(), (0, false));
        assert_eq!(index.get(&address(2)).unwrap(), Some(1));
        assert_eq!(index.get(&address(3)).unwrap(), None);
    }

    #[test]
    fn test_hash_is_chain_over_insertion_order() {
        let mut index = InMemoryIndex::new();
        assert_eq!(index.get_hash().unwrap(), ZERO_HASH);

        index.get_or_add(&address(1)).unwrap();
        index.get_or_add(&address(2)).unwrap();

        let expected = chain_hash(&chain_hash(&ZERO_HASH, &[1u8; 20]), &[2u8; 20]);
        assert_eq!(index.get_hash().unwrap(), expected);

        // Re-adding an existing key leaves the hash unchanged.
        index.get_or_add(&address(1)).unwrap();
        assert_eq!(index.get_hash().unwrap(), expected);
    }

    #[test]
    fn test_hash_is_incremental() {
        let mut index = InMemoryIndex::new();
        index.get_or_add(&address(1)).unwrap();
        let first = index.get_hash().unwrap();
        index.get_or_add(&address(2)).unwrap();
        assert_eq!(index.get_hash().unwrap(), chain_hash(&first, &[2u8; 20]));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut index = InMemoryIndex::new();
        for seed in 1..=5 {
            index.get_or_add(&address(seed)).unwrap();
        }
        let snapshot = index.create_snapshot().unwrap();

        // Later additions do not leak into the snapshot.
        index.get_or_add(&address(9)).unwrap();
        assert_eq!(snapshot.len(), 5);

        let mut restored = InMemoryIndex::from_snapshot(&snapshot);
        assert_eq!(restored.get(&address(3)).unwrap(), Some(2));
        assert_eq!(restored.get(&address(9)).unwrap(), None);

        let mut pristine = InMemoryIndex::new();
        for seed in 1..=5 {
            pristine.get_or_add(&address(seed)).unwrap();
        }
        assert_eq!(restored.get_hash().unwrap(), pristine.get_hash().unwrap());
    }

    #[test]
    fn test_snapshot_key_ranges_are_clamped() {
        let mut index = InMemoryIndex::new();
        index.get_or_add(&address(1)).unwrap();
        index.get_or_add(&address(2)).unwrap();
        let snapshot = index.create_snapshot().unwrap();
        assert_eq!(snapshot.keys(0, 10).len(), 2);
        assert_eq!(snapshot.keys(5, 10).len(), 0);
        assert_eq!(snapshot.keys(1, 2), &[address(2)]);
    }
}
