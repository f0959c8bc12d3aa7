// Indexes map domain keys to dense numeric IDs, assigned contiguously in
// insertion order. The content fingerprint is a chain hash over the key
// sequence.

mod cache;
mod file;
mod kv;
mod memory;

pub use cache::CachedIndex;
pub use file::FileIndex;
pub use kv::KvIndex;
pub use memory::{InMemoryIndex, IndexSnapshot};

use carmen_crypto::Hash;
use carmen_types::error::Result;
use carmen_types::FixedBytes;

/// Keys indexable by an [Index]: fixed-width, hashable, copyable.
pub trait IndexKey: FixedBytes + std::hash::Hash {}

impl<T: FixedBytes + std::hash::Hash> IndexKey for T {}

/// An injective, insertion-ordered mapping from keys to dense 32-bit IDs.
///
/// IDs start at 0, are assigned in insertion order, and are never reused; a
/// key keeps its ID for the lifetime of the database.
pub trait Index<K: IndexKey> {
    /// Returns the ID of the given key, assigning the next free ID if the
    /// key is new. The flag reports whether an assignment happened.
    fn get_or_add(&mut self, key: &K) -> Result<(u32, bool)>;

    /// Returns the ID of the given key, or `None` if it was never added.
    fn get(&mut self, key: &K) -> Result<Option<u32>>;

    fn contains(&mut self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Computes the chain hash over all keys in insertion order.
    fn get_hash(&mut self) -> Result<Hash>;

    /// Captures the index's key sequence for synchronization purposes. Only
    /// the in-memory backend supports this so far.
    fn create_snapshot(&mut self) -> Result<IndexSnapshot<K>> {
        Err(carmen_types::CarmenError::Unimplemented(
            "index snapshots are not supported by this backend".to_string(),
        ))
    }

    fn flush(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Encodes a key into a freshly allocated buffer.
pub(crate) fn key_bytes<K: IndexKey>(key: &K) -> Vec<u8> {
    let mut buffer = vec![0u8; K::LEN];
    key.write_to(&mut buffer);
    buffer
}
