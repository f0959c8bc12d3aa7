use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use carmen_crypto::{chain_hash, Hash, ZERO_HASH};
use carmen_types::error::{internal, Result};

use super::{key_bytes, Index, IndexKey};
use crate::eviction::LruPolicy;
use crate::file::{PageData, SingleFile, PAGE_SIZE};
use crate::pool::PagePool;

/// Initial number of bucket-address bits; the table starts with
/// `2^INITIAL_BITS` buckets.
const INITIAL_BITS: u32 = 2;

/// Number of pages retained in the index's page pool.
const POOL_CAPACITY: usize = 512;

/// Byte width of a page header: entry count (u16) plus successor link (u32,
/// stored as page id + 1 with 0 meaning none).
const PAGE_HEADER: usize = 6;

/// A stable 64-bit key hash. Bucket placement is persisted, so this must
/// never change across runs or builds (FNV-1a).
fn stable_hash(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Metadata checkpoint of a [FileIndex], stored next to the page file.
#[derive(Serialize, Deserialize)]
struct FileIndexMeta {
    low_mask: u64,
    next_to_split: u64,
    buckets: Vec<Option<u32>>,
    free_pages: Vec<u32>,
    num_pages: u32,
    next_id: u32,
    hash: Hash,
}

/// A persistent index backed by a linear-hash table over the page pool.
///
/// Unlike classical hash tables, growth is gradual: an insert into a full
/// bucket splits exactly one bucket (round-robin), so rehashing cost is
/// spread over many inserts instead of spiking on capacity breaches. Each
/// bucket is a chain of fixed-capacity pages whose entries are kept sorted
/// by the full key hash for log-time intra-page probes.
pub struct FileIndex<K: IndexKey> {
    pool: PagePool,
    meta_path: PathBuf,
    low_mask: u64,
    next_to_split: u64,
    buckets: Vec<Option<u32>>,
    free_pages: Vec<u32>,
    num_pages: u32,
    next_id: u32,
    hash: Hash,
    unhashed: Vec<K>,
    entry_len: usize,
    per_page: usize,
    _keys: PhantomData<K>,
}

impl<K: IndexKey> FileIndex<K> {
    pub fn open(directory: &Path) -> Result<Self> {
        std::fs::create_dir_all(directory)?;
        let file = SingleFile::open(directory.join("data.dat"))?;
        let pool = PagePool::new(
            Box::new(file),
            POOL_CAPACITY,
            Box::new(LruPolicy::new(POOL_CAPACITY)),
        );

        let entry_len = 8 + K::LEN + 4;
        let meta_path = directory.join("meta.dat");
        let mut index = Self {
            pool,
            meta_path,
            low_mask: (1 << INITIAL_BITS) - 1,
            next_to_split: 0,
            buckets: vec![None; 1 << INITIAL_BITS],
            free_pages: Vec::new(),
            num_pages: 0,
            next_id: 0,
            hash: ZERO_HASH,
            unhashed: Vec::new(),
            entry_len,
            per_page: (PAGE_SIZE - PAGE_HEADER) / entry_len,
            _keys: PhantomData,
        };

        if index.meta_path.exists() {
            let bytes = std::fs::read(&index.meta_path)?;
            let meta: FileIndexMeta = bincode::deserialize(&bytes).map_err(internal)?;
            index.low_mask = meta.low_mask;
            index.next_to_split = meta.next_to_split;
            index.buckets = meta.buckets;
            index.free_pages = meta.free_pages;
            index.num_pages = meta.num_pages;
            index.next_id = meta.next_id;
            index.hash = meta.hash;
        }
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.next_id as usize
    }

    pub fn is_empty(&self) -> bool {
        self.next_id == 0
    }

    fn high_mask(&self) -> u64 {
        (self.low_mask << 1) | 1
    }

    fn bucket_of(&self, hash: u64) -> usize {
        let bucket = (hash & self.high_mask()) as usize;
        if bucket >= self.buckets.len() {
            (hash & self.low_mask) as usize
        } else {
            bucket
        }
    }

    /// Locates the entry with the given hash and key bytes within a bucket's
    /// page chain.
    fn find_in_bucket(&mut self, bucket: usize, hash: u64, key: &[u8]) -> Result<Option<u32>> {
        let mut next = self.buckets[bucket];
        while let Some(page_id) = next {
            let data = self.pool.get(page_id as u64)?;
            let count = page_count(data);
            // Entries are sorted by hash: locate the first candidate, then
            // scan the run of equal hashes.
            let mut position =
                partition_point(count, |i| entry_hash(data, i, self.entry_len) < hash);
            while position < count && entry_hash(data, position, self.entry_len) == hash {
                if entry_key(data, position, self.entry_len, key.len()) == key {
                    return Ok(Some(entry_id(data, position, self.entry_len, key.len())));
                }
                position += 1;
            }
            next = page_next(data);
        }
        Ok(None)
    }

    fn bucket_is_full(&mut self, bucket: usize) -> Result<bool> {
        let mut next = self.buckets[bucket];
        while let Some(page_id) = next {
            let data = self.pool.get(page_id as u64)?;
            let successor = page_next(data);
            if successor.is_none() {
                return Ok(page_count(data) == self.per_page);
            }
            next = successor;
        }
        Ok(false)
    }

    fn alloc_page(&mut self) -> Result<u32> {
        let id = match self.free_pages.pop() {
            Some(id) => id,
            None => {
                let id = self.num_pages;
                self.num_pages += 1;
                id
            }
        };
        let data = self.pool.get_mut(id as u64)?;
        data.fill(0);
        self.pool.mark_dirty(id as u64);
        Ok(id)
    }

    /// Inserts a new entry into the bucket's tail page, chaining an overflow
    /// page when the tail is full.
    fn insert_entry(&mut self, bucket: usize, hash: u64, key: &[u8], id: u32) -> Result<()> {
        let tail = match self.buckets[bucket] {
            None => {
                let page = self.alloc_page()?;
                self.buckets[bucket] = Some(page);
                page
            }
            Some(head) => {
                let mut tail = head;
                loop {
                    let data = self.pool.get(tail as u64)?;
                    match page_next(data) {
                        Some(next) => tail = next,
                        None => break,
                    }
                }
                if page_count(self.pool.get(tail as u64)?) == self.per_page {
                    let page = self.alloc_page()?;
                    let data = self.pool.get_mut(tail as u64)?;
                    set_page_next(data, Some(page));
                    self.pool.mark_dirty(tail as u64);
                    tail = page;
                }
                tail
            }
        };

        let entry_len = self.entry_len;
        let per_page = self.per_page;
        let data = self.pool.get_mut(tail as u64)?;
        let count = page_count(data);
        debug_assert!(count < per_page);
        let position = partition_point(count, |i| entry_hash(data, i, entry_len) < hash);

        // Shift the tail of the page right by one entry and splice in.
        let start = PAGE_HEADER + position * entry_len;
        let end = PAGE_HEADER + count * entry_len;
        data.copy_within(start..end, start + entry_len);
        data[start..start + 8].copy_from_slice(&hash.to_le_bytes());
        data[start + 8..start + 8 + key.len()].copy_from_slice(key);
        data[start + 8 + key.len()..start + entry_len].copy_from_slice(&id.to_le_bytes());
        set_page_count(data, count + 1);
        self.pool.mark_dirty(tail as u64);
        Ok(())
    }

    /// Collects all raw entries of a bucket and the pages holding them.
    fn drain_bucket(&mut self, bucket: usize) -> Result<(Vec<(u64, Vec<u8>)>, Vec<u32>)> {
        let mut entries = Vec::new();
        let mut pages = Vec::new();
        let mut next = self.buckets[bucket];
        while let Some(page_id) = next {
            pages.push(page_id);
            let entry_len = self.entry_len;
            let data = self.pool.get(page_id as u64)?;
            for i in 0..page_count(data) {
                let start = PAGE_HEADER + i * entry_len;
                let raw = data[start..start + entry_len].to_vec();
                entries.push((entry_hash(data, i, entry_len), raw));
            }
            next = page_next(data);
        }
        Ok((entries, pages))
    }

    /// Writes a sorted entry list as a fresh page chain, reusing the given
    /// pages first. Returns the head page, or `None` for an empty list.
    fn write_bucket(
        &mut self,
        entries: &[(u64, Vec<u8>)],
        mut reusable: Vec<u32>,
    ) -> Result<Option<u32>> {
        reusable.reverse(); // pop from the front of the original order
        let mut head = None;
        let mut previous: Option<u32> = None;
        for chunk in entries.chunks(self.per_page) {
            let page_id = match reusable.pop() {
                Some(id) => {
                    let data = self.pool.get_mut(id as u64)?;
                    data.fill(0);
                    id
                }
                None => self.alloc_page()?,
            };
            let entry_len = self.entry_len;
            let data = self.pool.get_mut(page_id as u64)?;
            for (i, (_, raw)) in chunk.iter().enumerate() {
                let start = PAGE_HEADER + i * entry_len;
                data[start..start + entry_len].copy_from_slice(raw);
            }
            set_page_count(data, chunk.len());
            self.pool.mark_dirty(page_id as u64);

            if let Some(prev) = previous {
                let data = self.pool.get_mut(prev as u64)?;
                set_page_next(data, Some(page_id));
                self.pool.mark_dirty(prev as u64);
            } else {
                head = Some(page_id);
            }
            previous = Some(page_id);
        }
        self.free_pages.extend(reusable);
        Ok(head)
    }

    /// Splits bucket `next_to_split`, growing the table by one bucket and
    /// redistributing entries by the discriminating hash bit.
    fn split(&mut self) -> Result<()> {
        if self.next_to_split > self.low_mask {
            self.low_mask = self.high_mask();
            self.next_to_split = 0;
        }

        let old_bucket = self.next_to_split as usize;
        self.next_to_split += 1;
        self.buckets.push(None);
        let new_bucket = self.buckets.len() - 1;
        debug!(old_bucket, new_bucket, "splitting index bucket");

        let (entries, pages) = self.drain_bucket(old_bucket)?;
        let bit = self.low_mask + 1;
        let mut staying: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut moving: Vec<(u64, Vec<u8>)> = Vec::new();
        for entry in entries {
            if entry.0 & bit == 0 {
                staying.push(entry);
            } else {
                moving.push(entry);
            }
        }
        staying.sort_by_key(|e| e.0);
        moving.sort_by_key(|e| e.0);

        self.buckets[old_bucket] = self.write_bucket(&staying, pages)?;
        self.buckets[new_bucket] = self.write_bucket(&moving, Vec::new())?;
        Ok(())
    }
}

impl<K: IndexKey> Index<K> for FileIndex<K> {
    fn get_or_add(&mut self, key: &K) -> Result<(u32, bool)> {
        let bytes = key_bytes(key);
        let hash = stable_hash(&bytes);
        if let Some(id) = self.find_in_bucket(self.bucket_of(hash), hash, &bytes)? {
            return Ok((id, false));
        }

        if self.bucket_is_full(self.bucket_of(hash))? {
            self.split()?;
        }
        let bucket = self.bucket_of(hash);
        let id = self.next_id;
        self.next_id += 1;
        self.insert_entry(bucket, hash, &bytes, id)?;
        self.unhashed.push(*key);
        Ok((id, true))
    }

    fn get(&mut self, key: &K) -> Result<Option<u32>> {
        let bytes = key_bytes(key);
        let hash = stable_hash(&bytes);
        self.find_in_bucket(self.bucket_of(hash), hash, &bytes)
    }

    fn get_hash(&mut self) -> Result<Hash> {
        for key in std::mem::take(&mut self.unhashed) {
            self.hash = chain_hash(&self.hash, &key_bytes(&key));
        }
        Ok(self.hash)
    }

    fn flush(&mut self) -> Result<()> {
        self.get_hash()?;
        let meta = FileIndexMeta {
            low_mask: self.low_mask,
            next_to_split: self.next_to_split,
            buckets: self.buckets.clone(),
            free_pages: self.free_pages.clone(),
            num_pages: self.num_pages,
            next_id: self.next_id,
            hash: self.hash,
        };
        let bytes = bincode::serialize(&meta).map_err(internal)?;
        std::fs::write(&self.meta_path, bytes)?;
        self.pool.flush()
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.pool.close()
    }
}

// --- page layout helpers ---

fn page_count(data: &PageData) -> usize {
    u16::from_le_bytes([data[0], data[1]]) as usize
}

fn set_page_count(data: &mut PageData, count: usize) {
    data[0..2].copy_from_slice(&(count as u16).to_le_bytes());
}

fn page_next(data: &PageData) -> Option<u32> {
    let raw = u32::from_le_bytes(data[2..6].try_into().unwrap());
    if raw == 0 {
        None
    } else {
        Some(raw - 1)
    }
}

fn set_page_next(data: &mut PageData, next: Option<u32>) {
    let raw = next.map(|id| id + 1).unwrap_or(0);
    data[2..6].copy_from_slice(&raw.to_le_bytes());
}

fn entry_hash(data: &PageData, index: usize, entry_len: usize) -> u64 {
    let start = PAGE_HEADER + index * entry_len;
    u64::from_le_bytes(data[start..start + 8].try_into().unwrap())
}

fn entry_key<'a>(data: &'a PageData, index: usize, entry_len: usize, key_len: usize) -> &'a [u8] {
    let start = PAGE_HEADER + index * entry_len + 8;
    &data[start..start + key_len]
}

fn entry_id(data: &PageData, index: usize, entry_len: usize, key_len: usize) -> u32 {
    let start = PAGE_HEADER + index * entry_len + 8 + key_len;
    u32::from_le_bytes(data[start..start + 4].try_into().unwrap())
}

/// Index of the first entry in `0..count` for which the predicate is false;
/// the predicate must be monotone.
fn partition_point(count: usize, mut is_less: impl FnMut(usize) -> bool) -> usize {
    let mut low = 0;
    let mut high = count;
    while low < high {
        let mid = (low + high) / 2;
        if is_less(mid) {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    low
}
