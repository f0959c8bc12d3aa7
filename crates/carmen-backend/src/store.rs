use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use carmen_crypto::{sha256, Hash};
use carmen_types::error::Result;
use carmen_types::FixedBytes;

use crate::eviction::LruPolicy;
use crate::file::{InMemoryPagedFile, PageData, PageId, PagedFile, SingleFile, PAGE_SIZE};
use crate::hash_tree::{HashTree, PageSource};
use crate::kv::Kv;
use crate::pool::{PagePool, PoolListener};

/// Branching factor of store hash trees.
const BRANCHING_FACTOR: usize = 32;

/// Number of pages retained in a store's page pool.
const POOL_CAPACITY: usize = 1024;

/// Reserved key under which KV-backed components checkpoint their hash tree.
/// Data keys are 4 bytes wide, so the longer key cannot collide.
pub(crate) const HASH_TREE_KEY: &[u8] = b"__hash_tree__";

/// When to compute page hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hashing {
    /// Hash dirty pages while they are evicted, avoiding a later re-fetch.
    Eager,
    /// Only mark pages dirty; re-read them when the root hash is requested.
    Lazy,
}

/// A mutable map from dense integer keys to fixed-size values.
///
/// Stores behave as if pre-populated with the value type's zero: reads of
/// never-written keys return the default and do not allocate IDs.
pub trait Store<V: FixedBytes> {
    fn set(&mut self, id: u32, value: V) -> Result<()>;
    fn get(&mut self, id: u32) -> Result<V>;

    /// Computes a hash over the full content of this store.
    fn get_hash(&mut self) -> Result<Hash>;

    fn flush(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Hashes dirty pages on their way out of the pool so the hash tree does
/// not have to re-fetch them later.
///
/// Pages enter the hash tree through writes only; reads never extend it.
/// This keeps the root hash a function of the written content alone, so all
/// store backends agree on it.
struct EagerHashListener {
    tree: Arc<Mutex<HashTree>>,
}

impl PoolListener for EagerHashListener {
    fn after_load(&mut self, _id: PageId, _page: &PageData) {}

    fn before_evict(&mut self, id: PageId, page: &PageData, is_dirty: bool) {
        if is_dirty {
            self.tree.lock().update_hash(id, sha256(page));
        }
    }
}

/// A store packing values into fixed-size pages served by a page pool.
///
/// With a [SingleFile] backend the store persists to `<dir>/data.dat` with
/// its hash-tree checkpoint in `<dir>/hash.dat`; with a memory backend it is
/// a cheap volatile store for tests and the in-memory configuration.
pub struct PagedStore<V: FixedBytes> {
    pool: PagePool,
    tree: Arc<Mutex<HashTree>>,
    hash_file: Option<PathBuf>,
    per_page: usize,
    _values: PhantomData<V>,
}

impl<V: FixedBytes> PagedStore<V> {
    /// Opens a file-backed store in the given directory.
    pub fn open(directory: &Path, hashing: Hashing) -> Result<Self> {
        std::fs::create_dir_all(directory)?;
        let file = SingleFile::open(directory.join("data.dat"))?;
        let data_pages = file.num_pages();
        let hash_file = directory.join("hash.dat");
        let store = Self::with_file(Box::new(file), hashing, Some(hash_file.clone()));
        if hash_file.exists() {
            store.tree.lock().load_from_file(&hash_file)?;
        } else {
            // No checkpoint: every data page has to be re-hashed.
            let mut tree = store.tree.lock();
            for page in 0..data_pages {
                tree.mark_dirty(page);
            }
        }
        Ok(store)
    }

    /// Creates a volatile in-memory store.
    pub fn in_memory() -> Self {
        Self::with_file(Box::new(InMemoryPagedFile::new()), Hashing::Lazy, None)
    }

    fn with_file(
        file: Box<dyn PagedFile>,
        hashing: Hashing,
        hash_file: Option<PathBuf>,
    ) -> Self {
        let tree = Arc::new(Mutex::new(HashTree::new(BRANCHING_FACTOR)));
        let mut pool = PagePool::new(file, POOL_CAPACITY, Box::new(LruPolicy::new(POOL_CAPACITY)));
        if hashing == Hashing::Eager {
            pool.add_listener(Box::new(EagerHashListener { tree: tree.clone() }));
        }
        Self {
            pool,
            tree,
            hash_file,
            per_page: PAGE_SIZE / V::LEN,
            _values: PhantomData,
        }
    }
}

impl<V: FixedBytes> Store<V> for PagedStore<V> {
    fn set(&mut self, id: u32, value: V) -> Result<()> {
        let page = id as u64 / self.per_page as u64;
        let offset = (id as usize % self.per_page) * V::LEN;

        let mut encoded = vec![0u8; V::LEN];
        value.write_to(&mut encoded);

        let data = self.pool.get_mut(page)?;
        if data[offset..offset + V::LEN] == encoded[..] {
            return Ok(());
        }
        data[offset..offset + V::LEN].copy_from_slice(&encoded);
        self.pool.mark_dirty(page);
        self.tree.lock().mark_dirty(page);
        Ok(())
    }

    fn get(&mut self, id: u32) -> Result<V> {
        let page = id as u64 / self.per_page as u64;
        let offset = (id as usize % self.per_page) * V::LEN;
        let data = self.pool.get(page)?;
        Ok(V::read_from(&data[offset..offset + V::LEN]))
    }

    fn get_hash(&mut self) -> Result<Hash> {
        self.tree.lock().get_hash(&mut self.pool)
    }

    fn flush(&mut self) -> Result<()> {
        self.pool.flush()?;
        if let Some(path) = self.hash_file.clone() {
            self.tree.lock().save_to_file(&path, &mut self.pool)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.pool.close()
    }
}

/// Composes page images from a KV store so the hash tree sees the same page
/// layout as the paged variants.
struct KvPageSource<'a, V: FixedBytes> {
    kv: &'a Kv,
    per_page: usize,
    buffer: Vec<u8>,
    _values: PhantomData<V>,
}

impl<'a, V: FixedBytes> PageSource for KvPageSource<'a, V> {
    fn page_data(&mut self, id: PageId) -> Result<&[u8]> {
        self.buffer.clear();
        self.buffer.resize(PAGE_SIZE, 0);
        let first = id * self.per_page as u64;
        for slot in 0..self.per_page {
            let key = ((first + slot as u64) as u32).to_be_bytes();
            if let Some(value) = self.kv.get(&key)? {
                let offset = slot * V::LEN;
                self.buffer[offset..offset + V::LEN].copy_from_slice(&value);
            }
        }
        Ok(&self.buffer)
    }
}

/// A store persisting values in a KV database, one entry per id.
///
/// Page images for hashing are assembled from the KV range covering the
/// page, so KV-backed and file-backed stores of the same content agree on
/// their root hash.
pub struct KvStore<V: FixedBytes> {
    kv: Kv,
    tree: HashTree,
    per_page: usize,
    _values: PhantomData<V>,
}

impl<V: FixedBytes> KvStore<V> {
    pub fn open(directory: &Path) -> Result<Self> {
        std::fs::create_dir_all(directory)?;
        let kv = Kv::open(directory)?;
        let mut tree = HashTree::new(BRANCHING_FACTOR);
        if let Some(snapshot) = kv.get(HASH_TREE_KEY)? {
            tree.restore_from_bytes(&snapshot)?;
        }
        Ok(Self {
            kv,
            tree,
            per_page: PAGE_SIZE / V::LEN,
            _values: PhantomData,
        })
    }

}

impl<V: FixedBytes> Store<V> for KvStore<V> {
    fn set(&mut self, id: u32, value: V) -> Result<()> {
        let mut encoded = vec![0u8; V::LEN];
        value.write_to(&mut encoded);

        let key = id.to_be_bytes();
        // A missing entry is equivalent to the zero value; skipping the
        // write keeps the page set identical across store backends.
        let zero = vec![0u8; V::LEN];
        let current = self.kv.get(&key)?.unwrap_or(zero);
        if current == encoded {
            return Ok(());
        }
        self.kv.put(&key, &encoded)?;
        self.tree.mark_dirty(id as u64 / self.per_page as u64);
        Ok(())
    }

    fn get(&mut self, id: u32) -> Result<V> {
        match self.kv.get(&id.to_be_bytes())? {
            Some(bytes) if bytes.len() == V::LEN => Ok(V::read_from(&bytes)),
            Some(_) => Err(carmen_types::CarmenError::Internal(
                "stored value has the wrong size".to_string(),
            )),
            None => Ok(V::default()),
        }
    }

    fn get_hash(&mut self) -> Result<Hash> {
        let mut source = KvPageSource::<V> {
            kv: &self.kv,
            per_page: self.per_page,
            buffer: Vec::new(),
            _values: PhantomData,
        };
        self.tree.get_hash(&mut source)
    }

    fn flush(&mut self) -> Result<()> {
        let mut source = KvPageSource::<V> {
            kv: &self.kv,
            per_page: self.per_page,
            buffer: Vec::new(),
            _values: PhantomData,
        };
        let snapshot = self.tree.snapshot_bytes(&mut source)?;
        self.kv.put(HASH_TREE_KEY, &snapshot)?;
        self.kv.flush()
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carmen_types::{AccountState, Balance};
    use tempfile::TempDir;

    #[test]
    fn test_unwritten_ids_read_as_zero() {
        let mut store = PagedStore::<Balance>::in_memory();
        assert_eq!(store.get(0).unwrap(), Balance::zero());
        assert_eq!(store.get(123_456).unwrap(), Balance::zero());
    }

    #[test]
    fn test_set_get_round_trip() {
        let mut store = PagedStore::<Balance>::in_memory();
        store.set(7, Balance::from_u64(42)).unwrap();
        assert_eq!(store.get(7).unwrap(), Balance::from_u64(42));
        assert_eq!(store.get(8).unwrap(), Balance::zero());
    }

    #[test]
    fn test_hash_changes_with_content() {
        let mut store = PagedStore::<Balance>::in_memory();
        let empty = store.get_hash().unwrap();
        store.set(0, Balance::from_u64(1)).unwrap();
        let first = store.get_hash().unwrap();
        assert_ne!(first, empty);
        store.set(0, Balance::from_u64(2)).unwrap();
        assert_ne!(store.get_hash().unwrap(), first);
    }

    #[test]
    fn test_rewriting_same_value_keeps_hash() {
        let mut store = PagedStore::<AccountState>::in_memory();
        store.set(3, AccountState::Exists).unwrap();
        let before = store.get_hash().unwrap();
        store.set(3, AccountState::Exists).unwrap();
        assert_eq!(store.get_hash().unwrap(), before);
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let hash;
        {
            let mut store = PagedStore::<Balance>::open(dir.path(), Hashing::Eager).unwrap();
            store.set(9, Balance::from_u64(99)).unwrap();
            hash = store.get_hash().unwrap();
            store.close().unwrap();
        }
        let mut store = PagedStore::<Balance>::open(dir.path(), Hashing::Eager).unwrap();
        assert_eq!(store.get(9).unwrap(), Balance::from_u64(99));
        assert_eq!(store.get_hash().unwrap(), hash);
    }

    #[test]
    fn test_eager_and_lazy_hashing_agree() {
        let eager_dir = TempDir::new().unwrap();
        let lazy_dir = TempDir::new().unwrap();
        let mut eager = PagedStore::<Balance>::open(eager_dir.path(), Hashing::Eager).unwrap();
        let mut lazy = PagedStore::<Balance>::open(lazy_dir.path(), Hashing::Lazy).unwrap();
        for id in 0..2000u32 {
            let value = Balance::from_u64(id as u64 * 7);
            eager.set(id, value).unwrap();
            lazy.set(id, value).unwrap();
        }
        assert_eq!(eager.get_hash().unwrap(), lazy.get_hash().unwrap());
    }

    #[test]
    fn test_memory_and_kv_stores_agree_on_hash() {
        let dir = TempDir::new().unwrap();
        let mut memory = PagedStore::<Balance>::in_memory();
        let mut kv = KvStore::<Balance>::open(dir.path()).unwrap();
        for id in [0u32, 1, 200, 77] {
            let value = Balance::from_u64(id as u64 + 5);
            memory.set(id, value).unwrap();
            kv.set(id, value).unwrap();
        }
        assert_eq!(memory.get_hash().unwrap(), kv.get_hash().unwrap());
    }

    #[test]
    fn test_kv_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let hash;
        {
            let mut store = KvStore::<Balance>::open(dir.path()).unwrap();
            store.set(4, Balance::from_u64(17)).unwrap();
            hash = store.get_hash().unwrap();
            store.close().unwrap();
        }
        let mut store = KvStore::<Balance>::open(dir.path()).unwrap();
        assert_eq!(store.get(4).unwrap(), Balance::from_u64(17));
        assert_eq!(store.get_hash().unwrap(), hash);
    }
}
