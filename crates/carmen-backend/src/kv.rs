use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::{Options, WriteBatch, DB};

use carmen_types::error::{internal, Result};

/// A thin wrapper around a RocksDB handle, the ordered key-value backend of
/// KV-based indexes, stores, depots, and archives.
///
/// All lifetime management of the third-party handle stays inside this
/// module; the database is closed when the last clone is dropped.
#[derive(Clone)]
pub struct Kv {
    db: Arc<DB>,
}

impl Kv {
    /// Opens (or creates) a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref()).map_err(internal)?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.get(key).map_err(internal)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(key, value).map_err(internal)
    }

    /// Writes all entries atomically.
    pub fn write_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (key, value) in entries {
            batch.put(key, value);
        }
        self.db.write(batch).map_err(internal)
    }

    /// Returns the entry with the largest key that is less than or equal to
    /// the given key, if any.
    pub fn seek_for_prev(&self, key: &[u8]) -> Result<Option<(Box<[u8]>, Box<[u8]>)>> {
        let mut iter = self.db.raw_iterator();
        iter.seek_for_prev(key);
        if !iter.valid() {
            iter.status().map_err(internal)?;
            return Ok(None);
        }
        Ok(Some((
            iter.key().unwrap().into(),
            iter.value().unwrap().into(),
        )))
    }

    /// Iterates entries with keys starting with the given prefix, in key
    /// order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let mut result = Vec::new();
        let mut iter = self.db.raw_iterator();
        iter.seek(prefix);
        while iter.valid() {
            let key = iter.key().unwrap();
            if !key.starts_with(prefix) {
                break;
            }
            result.push((key.into(), iter.value().unwrap().into()));
            iter.next();
        }
        iter.status().map_err(internal)?;
        Ok(result)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(internal)
    }
}

/// A registry of resources shared between components opened under the same
/// root directory, e.g. one database multiplexed by several index key
/// spaces. Created once per open and passed down; never process-global.
pub struct Context {
    shared: HashMap<PathBuf, Kv>,
}

impl Context {
    pub fn new() -> Self {
        Self { shared: HashMap::new() }
    }

    /// Returns the shared database at the given path, opening it on first
    /// request.
    pub fn open_shared(&mut self, path: &Path) -> Result<Kv> {
        if let Some(kv) = self.shared.get(path) {
            return Ok(kv.clone());
        }
        let kv = Kv::open(path)?;
        self.shared.insert(path.to_path_buf(), kv.clone());
        Ok(kv)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
