use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;

use carmen_crypto::Hash;
use carmen_types::error::Result;

use crate::file::PageId;
use crate::hash_tree::{HashTree, PageSource};
use crate::kv::Kv;
use crate::store::HASH_TREE_KEY;

/// Branching factor of depot hash trees.
const BRANCHING_FACTOR: usize = 32;

/// Number of consecutive depot entries grouped into one hash box.
const BOX_SIZE: usize = 4;

/// A store mapping dense integer keys to variable-length byte blobs.
///
/// For hashing, consecutive keys are grouped into boxes of [BOX_SIZE]
/// entries; each box is rendered as `BOX_SIZE` u32-LE length prefixes (0 for
/// absent entries) followed by the concatenated blobs, and a hash tree over
/// the boxes yields the root.
pub trait Depot {
    /// Stores the given blob under the key, replacing any previous value.
    fn set(&mut self, id: u32, data: &[u8]) -> Result<()>;

    /// Returns the blob stored under the key, or `None` if the key lies
    /// beyond everything ever stored.
    fn get(&mut self, id: u32) -> Result<Option<Vec<u8>>>;

    /// Returns the size of the blob stored under the key.
    fn size(&mut self, id: u32) -> Result<Option<u32>>;

    /// Computes a hash over the full content of this depot.
    fn get_hash(&mut self) -> Result<Hash>;

    fn flush(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Renders box images from an in-memory item list.
struct SliceBoxSource<'a> {
    items: &'a [Vec<u8>],
    buffer: Vec<u8>,
}

impl<'a> PageSource for SliceBoxSource<'a> {
    fn page_data(&mut self, id: PageId) -> Result<&[u8]> {
        let first = id as usize * BOX_SIZE;
        self.buffer.clear();
        self.buffer.resize(BOX_SIZE * 4, 0);
        for slot in 0..BOX_SIZE {
            if let Some(item) = self.items.get(first + slot) {
                self.buffer[slot * 4..slot * 4 + 4]
                    .copy_from_slice(&(item.len() as u32).to_le_bytes());
            }
        }
        for slot in 0..BOX_SIZE {
            if let Some(item) = self.items.get(first + slot) {
                self.buffer.extend_from_slice(item);
            }
        }
        Ok(&self.buffer)
    }
}

/// In-memory depot implementation.
pub struct InMemoryDepot {
    items: Vec<Vec<u8>>,
    tree: HashTree,
}

impl InMemoryDepot {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            tree: HashTree::new(BRANCHING_FACTOR),
        }
    }
}

impl Default for InMemoryDepot {
    fn default() -> Self {
        Self::new()
    }
}

impl Depot for InMemoryDepot {
    fn set(&mut self, id: u32, data: &[u8]) -> Result<()> {
        if id as usize >= self.items.len() {
            self.items.resize(id as usize + 1, Vec::new());
        }
        self.items[id as usize] = data.to_vec();
        self.tree.mark_dirty(id as u64 / BOX_SIZE as u64);
        Ok(())
    }

    fn get(&mut self, id: u32) -> Result<Option<Vec<u8>>> {
        Ok(self.items.get(id as usize).cloned())
    }

    fn size(&mut self, id: u32) -> Result<Option<u32>> {
        Ok(self.items.get(id as usize).map(|item| item.len() as u32))
    }

    fn get_hash(&mut self) -> Result<Hash> {
        let mut source = SliceBoxSource { items: &self.items, buffer: Vec::new() };
        self.tree.get_hash(&mut source)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A depot keeping its working set in memory and checkpointing it to a file
/// on flush. Suited for moderately sized blob sets such as contract codes.
pub struct FileDepot {
    inner: InMemoryDepot,
    data_path: std::path::PathBuf,
}

impl FileDepot {
    pub fn open(directory: &Path) -> Result<Self> {
        std::fs::create_dir_all(directory)?;
        let data_path = directory.join("data.dat");
        let mut inner = InMemoryDepot::new();
        if data_path.exists() {
            let bytes = std::fs::read(&data_path)?;
            let items: Vec<Vec<u8>> =
                bincode::deserialize(&bytes).map_err(carmen_types::error::internal)?;
            for (id, item) in items.iter().enumerate() {
                inner.set(id as u32, item)?;
            }
        }
        Ok(Self { inner, data_path })
    }
}

impl Depot for FileDepot {
    fn set(&mut self, id: u32, data: &[u8]) -> Result<()> {
        self.inner.set(id, data)
    }

    fn get(&mut self, id: u32) -> Result<Option<Vec<u8>>> {
        self.inner.get(id)
    }

    fn size(&mut self, id: u32) -> Result<Option<u32>> {
        self.inner.size(id)
    }

    fn get_hash(&mut self) -> Result<Hash> {
        self.inner.get_hash()
    }

    fn flush(&mut self) -> Result<()> {
        let bytes =
            bincode::serialize(&self.inner.items).map_err(carmen_types::error::internal)?;
        std::fs::write(&self.data_path, bytes)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// Renders box images by fetching the covered entries from the KV store.
struct KvBoxSource<'a> {
    kv: &'a Kv,
    buffer: Vec<u8>,
}

impl<'a> PageSource for KvBoxSource<'a> {
    fn page_data(&mut self, id: PageId) -> Result<&[u8]> {
        let first = id * BOX_SIZE as u64;
        let mut items: Vec<Option<Vec<u8>>> = Vec::with_capacity(BOX_SIZE);
        for slot in 0..BOX_SIZE as u64 {
            items.push(self.kv.get(&((first + slot) as u32).to_be_bytes())?);
        }
        self.buffer.clear();
        self.buffer.resize(BOX_SIZE * 4, 0);
        for (slot, item) in items.iter().enumerate() {
            if let Some(item) = item {
                self.buffer[slot * 4..slot * 4 + 4]
                    .copy_from_slice(&(item.len() as u32).to_le_bytes());
            }
        }
        for item in items.iter().flatten() {
            self.buffer.extend_from_slice(item);
        }
        Ok(&self.buffer)
    }
}

/// A depot persisting blobs in a KV database, one entry per id.
pub struct KvDepot {
    kv: Kv,
    tree: HashTree,
}

impl KvDepot {
    pub fn open(directory: &Path) -> Result<Self> {
        std::fs::create_dir_all(directory)?;
        let kv = Kv::open(directory)?;
        let mut tree = HashTree::new(BRANCHING_FACTOR);
        if let Some(snapshot) = kv.get(HASH_TREE_KEY)? {
            tree.restore_from_bytes(&snapshot)?;
        }
        Ok(Self { kv, tree })
    }
}

impl Depot for KvDepot {
    fn set(&mut self, id: u32, data: &[u8]) -> Result<()> {
        self.kv.put(&id.to_be_bytes(), data)?;
        self.tree.mark_dirty(id as u64 / BOX_SIZE as u64);
        Ok(())
    }

    fn get(&mut self, id: u32) -> Result<Option<Vec<u8>>> {
        self.kv.get(&id.to_be_bytes())
    }

    fn size(&mut self, id: u32) -> Result<Option<u32>> {
        Ok(self.kv.get(&id.to_be_bytes())?.map(|item| item.len() as u32))
    }

    fn get_hash(&mut self) -> Result<Hash> {
        let mut source = KvBoxSource { kv: &self.kv, buffer: Vec::new() };
        self.tree.get_hash(&mut source)
    }

    fn flush(&mut self) -> Result<()> {
        let mut source = KvBoxSource { kv: &self.kv, buffer: Vec::new() };
        let snapshot = self.tree.snapshot_bytes(&mut source)?;
        self.kv.put(HASH_TREE_KEY, &snapshot)?;
        self.kv.flush()
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// Default number of cached depot entries.
const CACHE_CAPACITY: usize = 1 << 16;

/// An LRU read-through cache around another depot.
///
/// Blob reads and sizes are served from the cache where possible; the root
/// hash is memoized and invalidated on every write.
pub struct CachedDepot<D: Depot> {
    depot: D,
    cache: LruCache<u32, Option<Vec<u8>>>,
    hash: Option<Hash>,
}

impl<D: Depot> CachedDepot<D> {
    pub fn new(depot: D) -> Self {
        Self::with_capacity(depot, CACHE_CAPACITY)
    }

    pub fn with_capacity(depot: D, capacity: usize) -> Self {
        Self {
            depot,
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
            hash: None,
        }
    }
}

impl<D: Depot> Depot for CachedDepot<D> {
    fn set(&mut self, id: u32, data: &[u8]) -> Result<()> {
        self.depot.set(id, data)?;
        self.cache.put(id, Some(data.to_vec()));
        self.hash = None;
        Ok(())
    }

    fn get(&mut self, id: u32) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = self.cache.get(&id) {
            return Ok(cached.clone());
        }
        let result = self.depot.get(id)?;
        self.cache.put(id, result.clone());
        Ok(result)
    }

    fn size(&mut self, id: u32) -> Result<Option<u32>> {
        Ok(self.get(id)?.map(|item| item.len() as u32))
    }

    fn get_hash(&mut self) -> Result<Hash> {
        if let Some(hash) = self.hash {
            return Ok(hash);
        }
        let hash = self.depot.get_hash()?;
        self.hash = Some(hash);
        Ok(hash)
    }

    fn flush(&mut self) -> Result<()> {
        self.depot.flush()
    }

    fn close(&mut self) -> Result<()> {
        self.depot.close()
    }
}
