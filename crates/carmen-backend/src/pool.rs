use std::collections::HashMap;

use rand::Rng;
use tracing::debug;

use carmen_types::error::Result;

use crate::eviction::EvictionPolicy;
use crate::file::{PageData, PageId, PagedFile, PAGE_SIZE};
use crate::hash_tree::PageSource;

/// An observer of page pool activity, used to inject work on page load and
/// eviction (e.g. hash bookkeeping).
pub trait PoolListener {
    /// Called synchronously after a page's bytes are materialized in the
    /// pool, before the triggering `get` returns.
    fn after_load(&mut self, id: PageId, page: &PageData);

    /// Called synchronously before any I/O or state mutation caused by the
    /// eviction of a page.
    fn before_evict(&mut self, id: PageId, page: &PageData, is_dirty: bool);
}

/// A fixed-capacity in-memory cache of file pages.
///
/// The pool sits between a [PagedFile] and a store: it caches loaded pages,
/// aggregates writes through dirty bits, and delegates victim selection to a
/// pluggable [EvictionPolicy].
pub struct PagePool {
    file: Box<dyn PagedFile>,
    buffers: Vec<Box<PageData>>,
    capacity: usize,
    policy: Box<dyn EvictionPolicy>,
    dirty: Vec<bool>,
    page_to_slot: HashMap<PageId, usize>,
    slot_to_page: Vec<PageId>,
    free_list: Vec<usize>,
    listeners: Vec<Box<dyn PoolListener>>,
}

impl PagePool {
    pub fn new(file: Box<dyn PagedFile>, capacity: usize, policy: Box<dyn EvictionPolicy>) -> Self {
        let capacity = capacity.max(1);
        Self {
            file,
            buffers: (0..capacity).map(|_| Box::new([0u8; PAGE_SIZE])).collect(),
            capacity,
            policy,
            dirty: vec![false; capacity],
            page_to_slot: HashMap::with_capacity(capacity),
            slot_to_page: vec![0; capacity],
            // Popped from the back, so slot 0 is handed out first.
            free_list: (0..capacity).rev().collect(),
            listeners: Vec::new(),
        }
    }

    /// The maximum number of pages retained by this pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of pages currently resident.
    pub fn resident(&self) -> usize {
        self.page_to_slot.len()
    }

    /// Registers a listener; listeners are notified in registration order.
    pub fn add_listener(&mut self, listener: Box<dyn PoolListener>) {
        self.listeners.push(listener);
    }

    /// Returns the page with the given id, fetching it from the file if it
    /// is not resident. May evict another page to make space.
    pub fn get(&mut self, id: PageId) -> Result<&PageData> {
        let slot = self.slot_of(id)?;
        Ok(&self.buffers[slot])
    }

    /// Mutable variant of [PagePool::get]. Callers that modify the page must
    /// also call [PagePool::mark_dirty].
    pub fn get_mut(&mut self, id: PageId) -> Result<&mut PageData> {
        let slot = self.slot_of(id)?;
        Ok(&mut self.buffers[slot])
    }

    /// Marks the given page as modified so it is written back before being
    /// dropped from the pool.
    pub fn mark_dirty(&mut self, id: PageId) {
        if let Some(&slot) = self.page_to_slot.get(&id) {
            self.dirty[slot] = true;
            self.policy.written(slot);
        }
    }

    /// Writes back all dirty pages without evicting anything and without
    /// touching the eviction policy.
    pub fn flush(&mut self) -> Result<()> {
        for slot in 0..self.capacity {
            if !self.dirty[slot] {
                continue;
            }
            self.file.store_page(self.slot_to_page[slot], &self.buffers[slot])?;
            self.dirty[slot] = false;
        }
        self.file.flush()
    }

    /// Flushes the pool and closes the underlying file.
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.file.close()
    }

    fn slot_of(&mut self, id: PageId) -> Result<usize> {
        if let Some(&slot) = self.page_to_slot.get(&id) {
            self.policy.read(slot);
            return Ok(slot);
        }

        let slot = self.free_slot()?;
        self.file.load_page(id, &mut self.buffers[slot])?;
        self.page_to_slot.insert(id, slot);
        self.slot_to_page[slot] = id;
        self.policy.read(slot);
        for listener in &mut self.listeners {
            listener.after_load(id, &self.buffers[slot]);
        }
        Ok(slot)
    }

    fn free_slot(&mut self) -> Result<usize> {
        if let Some(slot) = self.free_list.pop() {
            return Ok(slot);
        }

        // All slots occupied; ask the policy for a victim. If it cannot
        // decide, fall back to a random slot.
        let victim = self
            .policy
            .next_eviction()
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..self.capacity));
        self.evict_slot(victim)?;
        Ok(victim)
    }

    fn evict_slot(&mut self, slot: usize) -> Result<()> {
        let page_id = self.slot_to_page[slot];
        let is_dirty = self.dirty[slot];
        debug!(page_id, slot, is_dirty, "evicting page");
        for listener in &mut self.listeners {
            listener.before_evict(page_id, &self.buffers[slot], is_dirty);
        }
        if is_dirty {
            self.file.store_page(page_id, &self.buffers[slot])?;
            self.dirty[slot] = false;
        }
        self.page_to_slot.remove(&page_id);
        self.policy.removed(slot);
        Ok(())
    }
}

impl PageSource for PagePool {
    fn page_data(&mut self, id: PageId) -> Result<&[u8]> {
        Ok(&self.get(id)?[..])
    }
}
