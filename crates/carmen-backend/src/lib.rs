// Carmen storage backend
// The leaf-first storage stack: paged files, the in-memory page pool with
// pluggable eviction, the hash tree aggregating page hashes, and the
// store/index/depot/multimap primitives composed into live states.

pub mod depot;
pub mod eviction;
pub mod file;
pub mod hash_tree;
pub mod index;
pub mod kv;
pub mod multimap;
pub mod pool;
pub mod store;

pub use depot::{CachedDepot, Depot, FileDepot, InMemoryDepot, KvDepot};
pub use eviction::{EvictionPolicy, LruPolicy, RandomPolicy};
pub use file::{InMemoryPagedFile, PageData, PageId, PagedFile, SingleFile, PAGE_SIZE};
pub use hash_tree::{HashTree, PageSource};
pub use index::{CachedIndex, FileIndex, Index, IndexKey, IndexSnapshot, InMemoryIndex, KvIndex};
pub use kv::{Context, Kv};
pub use multimap::InMemoryMultiMap;
pub use pool::{PagePool, PoolListener};
pub use store::{Hashing, KvStore, PagedStore, Store};
