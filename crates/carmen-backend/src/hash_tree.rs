use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use carmen_crypto::{sha256, Hash, Sha256Hasher, ZERO_HASH};
use carmen_types::error::{internal, CarmenError, Result};

use crate::file::PageId;

/// A source of page data consulted by the [HashTree] when refreshing dirty
/// page hashes. The page pool implements this so hash computation reads
/// through the cache; depots compose synthetic box pages.
pub trait PageSource {
    /// Returns the byte content of the given page; the slice is valid until
    /// the next call.
    fn page_data(&mut self, id: PageId) -> Result<&[u8]>;
}

/// On-disk image of a hash tree: the leaf layer is authoritative, interior
/// layers are rebuilt on load.
#[derive(Serialize, Deserialize)]
struct HashTreeSnapshot {
    num_pages: u64,
    leaves: Vec<Hash>,
}

/// Aggregates per-page hashes into a single root via a fixed-arity reduction
/// tree.
///
/// Level 0 holds one SHA-256 hash per page; every higher level hashes groups
/// of `branching` child hashes, with incomplete groups padded by the zero
/// hash. Dirty pages are re-hashed from the page source on demand; dirty
/// interior positions are re-reduced bottom-up.
pub struct HashTree {
    branching: usize,
    levels: Vec<Vec<Hash>>,
    num_pages: u64,
    dirty_pages: HashSet<PageId>,
    dirty_level_one: HashSet<usize>,
}

impl HashTree {
    pub fn new(branching: usize) -> Self {
        assert!(branching >= 2, "hash tree branching factor must be at least 2");
        Self {
            branching,
            levels: Vec::new(),
            num_pages: 0,
            dirty_pages: HashSet::new(),
            dirty_level_one: HashSet::new(),
        }
    }

    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// Informs the tree about the existence of the given page. Newly seen
    /// pages are considered dirty.
    pub fn register_page(&mut self, id: PageId) {
        self.track_num_pages(id);
    }

    /// Marks a page's content as changed; its hash is refreshed from the
    /// page source on the next root computation.
    pub fn mark_dirty(&mut self, id: PageId) {
        self.track_num_pages(id);
        self.dirty_pages.insert(id);
    }

    /// Installs an externally computed page hash, e.g. one produced while
    /// the page was still resident during eviction.
    pub fn update_hash(&mut self, id: PageId, hash: Hash) {
        self.track_num_pages(id);
        self.set_hash(0, id as usize, hash);
        self.dirty_pages.remove(&id);
        self.dirty_level_one.insert(id as usize / self.branching);
    }

    /// Computes the root hash, refreshing dirty pages from `source` first.
    /// An empty tree hashes to the zero hash.
    pub fn get_hash(&mut self, source: &mut dyn PageSource) -> Result<Hash> {
        if self.num_pages == 0 {
            return Ok(ZERO_HASH);
        }

        if self.dirty_pages.is_empty() && self.dirty_level_one.is_empty() {
            return Ok(self.levels.last().map(|l| l[0]).unwrap_or(ZERO_HASH));
        }

        // Refresh the hashes of dirty pages.
        let mut dirty_parents = HashSet::new();
        let dirty_pages: Vec<PageId> = self.dirty_pages.drain().collect();
        for id in dirty_pages {
            let hash = sha256(source.page_data(id)?);
            self.set_hash(0, id as usize, hash);
            dirty_parents.insert(id as usize / self.branching);
        }

        // A single page is its own root.
        if self.num_pages == 1 {
            return Ok(self.levels[0][0]);
        }

        dirty_parents.extend(self.dirty_level_one.drain());

        // Aggregate bottom-up until a level collapses to a single group.
        let mut level = 1;
        loop {
            let mut next_dirty = HashSet::new();
            for &pos in &dirty_parents {
                let hash = self.reduce_group(level, pos);
                self.set_hash(level, pos, hash);
                next_dirty.insert(pos / self.branching);
            }
            if self.levels[level - 1].len() <= self.branching {
                return Ok(self.levels[level][0]);
            }
            dirty_parents = next_dirty;
            level += 1;
        }
    }

    /// Saves the tree to the given file, refreshing dirty hashes first.
    pub fn save_to_file(&mut self, path: &Path, source: &mut dyn PageSource) -> Result<()> {
        let bytes = self.snapshot_bytes(source)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Discards the current content and loads the tree from the given file.
    /// Loaded hashes are considered up to date.
    pub fn load_from_file(&mut self, path: &Path) -> Result<()> {
        let bytes = fs::read(path)?;
        self.restore_from_bytes(&bytes)
    }

    /// Serializes the tree state, refreshing dirty hashes first. Used for
    /// persistence into key-value backends under a reserved key.
    pub fn snapshot_bytes(&mut self, source: &mut dyn PageSource) -> Result<Vec<u8>> {
        self.get_hash(source)?;
        let leaves = if self.num_pages == 0 {
            Vec::new()
        } else {
            self.levels[0][..self.num_pages as usize].to_vec()
        };
        let snapshot = HashTreeSnapshot { num_pages: self.num_pages, leaves };
        bincode::serialize(&snapshot).map_err(internal)
    }

    /// Restores the tree from serialized state, rebuilding interior levels.
    pub fn restore_from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let snapshot: HashTreeSnapshot = bincode::deserialize(bytes).map_err(internal)?;
        if snapshot.leaves.len() as u64 != snapshot.num_pages {
            return Err(CarmenError::Internal(
                "hash tree checkpoint is inconsistent".to_string(),
            ));
        }
        self.levels.clear();
        self.dirty_pages.clear();
        self.dirty_level_one.clear();
        self.num_pages = snapshot.num_pages;
        for (pos, leaf) in snapshot.leaves.into_iter().enumerate() {
            self.set_hash(0, pos, leaf);
        }
        // Interior levels are rebuilt on the next root computation.
        if self.num_pages > 1 {
            let parents = (self.num_pages as usize + self.branching - 1) / self.branching;
            self.dirty_level_one.extend(0..parents);
        }
        Ok(())
    }

    fn reduce_group(&mut self, level: usize, pos: usize) -> Hash {
        // Ensure the child layer covers the full group, padded with zero
        // hashes.
        let end = (pos + 1) * self.branching;
        let children = &mut self.levels[level - 1];
        if children.len() < end {
            children.resize(padded_size(end, self.branching), ZERO_HASH);
        }
        let mut hasher = Sha256Hasher::new();
        for child in &children[pos * self.branching..end] {
            hasher.ingest(child);
        }
        hasher.finish()
    }

    fn set_hash(&mut self, level: usize, pos: usize, hash: Hash) {
        if level >= self.levels.len() {
            self.levels.resize(level + 1, Vec::new());
        }
        let layer = &mut self.levels[level];
        if pos >= layer.len() {
            layer.resize(padded_size(pos + 1, self.branching), ZERO_HASH);
        }
        layer[pos] = hash;
    }

    fn track_num_pages(&mut self, id: PageId) {
        if id < self.num_pages {
            return;
        }
        // All pages up to the new end are considered dirty; intermediate
        // pages hash as zero pages until touched.
        for page in self.num_pages..=id {
            self.dirty_pages.insert(page);
        }
        self.num_pages = id + 1;
    }
}

fn padded_size(min_size: usize, block_size: usize) -> usize {
    if min_size % block_size == 0 {
        min_size
    } else {
        (min_size / block_size + 1) * block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct VecSource {
        pages: Vec<Vec<u8>>,
    }

    impl PageSource for VecSource {
        fn page_data(&mut self, id: PageId) -> Result<&[u8]> {
            Ok(&self.pages[id as usize])
        }
    }

    fn page(seed: u8) -> Vec<u8> {
        vec![seed; 64]
    }

    fn parent(left: &Hash, right: &Hash) -> Hash {
        let mut buffer = Vec::with_capacity(64);
        buffer.extend_from_slice(left);
        buffer.extend_from_slice(right);
        sha256(&buffer)
    }

    #[test]
    fn test_empty_tree_is_zero() {
        let mut tree = HashTree::new(32);
        let mut source = VecSource { pages: vec![] };
        assert_eq!(tree.get_hash(&mut source).unwrap(), ZERO_HASH);
    }

    #[test]
    fn test_single_page_root_is_page_hash() {
        let mut tree = HashTree::new(32);
        let mut source = VecSource { pages: vec![page(1)] };
        tree.mark_dirty(0);
        assert_eq!(tree.get_hash(&mut source).unwrap(), sha256(&page(1)));
    }

    #[test]
    fn test_four_leaf_reduction_with_branching_two() {
        let mut tree = HashTree::new(2);
        let mut source = VecSource {
            pages: vec![page(0), page(1), page(2), page(3)],
        };
        for id in 0..4 {
            tree.mark_dirty(id);
        }

        let h: Vec<Hash> = (0..4).map(|i| sha256(&page(i))).collect();
        let expected = parent(&parent(&h[0], &h[1]), &parent(&h[2], &h[3]));
        assert_eq!(tree.get_hash(&mut source).unwrap(), expected);
    }

    #[test]
    fn test_three_leaves_pad_with_zero_hash() {
        let mut tree = HashTree::new(2);
        let mut source = VecSource {
            pages: vec![page(0), page(1), page(2)],
        };
        for id in 0..3 {
            tree.mark_dirty(id);
        }

        let h: Vec<Hash> = (0..3).map(|i| sha256(&page(i))).collect();
        let expected = parent(&parent(&h[0], &h[1]), &parent(&h[2], &ZERO_HASH));
        assert_eq!(tree.get_hash(&mut source).unwrap(), expected);
    }

    #[test]
    fn test_root_is_cached_until_dirty() {
        let mut tree = HashTree::new(2);
        let mut source = VecSource {
            pages: vec![page(0), page(1)],
        };
        tree.mark_dirty(0);
        tree.mark_dirty(1);
        let first = tree.get_hash(&mut source).unwrap();
        assert_eq!(tree.get_hash(&mut source).unwrap(), first);

        // Changing a page changes the root.
        source.pages[1] = page(9);
        tree.mark_dirty(1);
        let second = tree.get_hash(&mut source).unwrap();
        assert_ne!(second, first);
    }

    #[test]
    fn test_update_hash_replaces_recomputation() {
        let mut tree = HashTree::new(2);
        let mut source = VecSource {
            pages: vec![page(0), page(1)],
        };
        tree.mark_dirty(0);
        tree.mark_dirty(1);
        let expected = tree.get_hash(&mut source).unwrap();

        // A fresh tree fed the leaf hashes directly agrees without ever
        // touching page 1's data.
        let mut eager = HashTree::new(2);
        eager.mark_dirty(0);
        eager.update_hash(1, sha256(&page(1)));
        assert_eq!(eager.get_hash(&mut source).unwrap(), expected);
    }

    #[test]
    fn test_growth_marks_intermediate_pages_dirty() {
        let mut tree = HashTree::new(4);
        let mut source = VecSource {
            pages: (0..9).map(|_| vec![0u8; 16]).collect(),
        };
        source.pages[8] = page(8);
        tree.mark_dirty(8);
        assert_eq!(tree.num_pages(), 9);
        // All nine pages participate; no panic on the padded reduction.
        tree.get_hash(&mut source).unwrap();
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hash.dat");

        let mut tree = HashTree::new(2);
        let mut source = VecSource {
            pages: vec![page(0), page(1), page(2)],
        };
        for id in 0..3 {
            tree.mark_dirty(id);
        }
        let root = tree.get_hash(&mut source).unwrap();
        tree.save_to_file(&path, &mut source).unwrap();

        let mut restored = HashTree::new(2);
        restored.load_from_file(&path).unwrap();
        assert_eq!(restored.num_pages(), 3);
        // The restored tree reproduces the root without consulting pages.
        let mut empty = VecSource { pages: vec![] };
        assert_eq!(restored.get_hash(&mut empty).unwrap(), root);
    }

    #[test]
    fn test_corrupt_checkpoint_is_rejected() {
        let mut tree = HashTree::new(2);
        assert!(tree.restore_from_bytes(b"not a checkpoint").is_err());
    }
}
