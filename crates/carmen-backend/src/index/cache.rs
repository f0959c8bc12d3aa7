use std::num::NonZeroUsize;

use lru::LruCache;

use carmen_crypto::Hash;
use carmen_types::error::Result;

use super::{Index, IndexKey};

/// Default number of cached entries (~1 million).
const DEFAULT_CAPACITY: usize = 1 << 20;

/// An LRU read-through cache around another index.
///
/// Both hits and misses are cached: a `None` entry records a key known to be
/// absent. The root hash is memoized and invalidated whenever a new key is
/// assigned an ID.
pub struct CachedIndex<K: IndexKey, I: Index<K>> {
    index: I,
    cache: LruCache<K, Option<u32>>,
    hash: Option<Hash>,
}

impl<K: IndexKey, I: Index<K>> CachedIndex<K, I> {
    pub fn new(index: I) -> Self {
        Self::with_capacity(index, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(index: I, capacity: usize) -> Self {
        Self {
            index,
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
            hash: None,
        }
    }

    pub fn inner(&self) -> &I {
        &self.index
    }
}

impl<K: IndexKey, I: Index<K>> Index<K> for CachedIndex<K, I> {
    fn get_or_add(&mut self, key: &K) -> Result<(u32, bool)> {
        if let Some(Some(id)) = self.cache.get(key) {
            return Ok((*id, false));
        }
        let (id, is_new) = self.index.get_or_add(key)?;
        self.cache.put(*key, Some(id));
        if is_new {
            self.hash = None;
        }
        Ok((id, is_new))
    }

    fn get(&mut self, key: &K) -> Result<Option<u32>> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(*cached);
        }
        let result = self.index.get(key)?;
        self.cache.put(*key, result);
        Ok(result)
    }

    fn get_hash(&mut self) -> Result<Hash> {
        if let Some(hash) = self.hash {
            return Ok(hash);
        }
        let hash = self.index.get_hash()?;
        self.hash = Some(hash);
        Ok(hash)
    }

    fn flush(&mut self) -> Result<()> {
        self.index.flush()
    }

    fn close(&mut self) -> Result<()> {
        self.index.close()
    }
}
