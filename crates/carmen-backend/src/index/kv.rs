use std::marker::PhantomData;
use std::path::Path;

use carmen_crypto::{chain_hash, Hash, ZERO_HASH};
use carmen_types::error::{CarmenError, Result};

use super::{key_bytes, Index, IndexKey};
use crate::kv::{Context, Kv};

/// Sentinel suffix recording the next ID to assign.
const LAST_INDEX_SUFFIX: &[u8] = b"_last_index";

/// Sentinel suffix persisting the chain hash.
const HASH_SUFFIX: &[u8] = b"_hash";

/// An index persisting its entries in a KV database.
///
/// Entries are stored as `key_space byte + key bytes -> 8-byte LE id`.
/// Several key spaces may multiplex one database file; the shared handle is
/// obtained from the open [Context]. Sentinel keys (key space + suffix)
/// cannot collide with entry keys because their lengths differ.
pub struct KvIndex<K: IndexKey> {
    kv: Kv,
    key_space: u8,
    next_id: Option<u32>,
    hash: Option<Hash>,
    unhashed: Vec<K>,
    _keys: PhantomData<K>,
}

impl<K: IndexKey> KvIndex<K> {
    /// Opens the key space within the shared database at the given path.
    pub fn open(context: &mut Context, path: &Path, key_space: u8) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let kv = context.open_shared(path)?;
        Ok(Self::with_kv(kv, key_space))
    }

    /// Uses an already opened database handle directly.
    pub fn with_kv(kv: Kv, key_space: u8) -> Self {
        Self {
            kv,
            key_space,
            next_id: None,
            hash: None,
            unhashed: Vec::new(),
            _keys: PhantomData,
        }
    }

    fn db_key(&self, key: &K) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(1 + K::LEN);
        buffer.push(self.key_space);
        buffer.extend_from_slice(&key_bytes(key));
        buffer
    }

    fn sentinel(&self, suffix: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(1 + suffix.len());
        buffer.push(self.key_space);
        buffer.extend_from_slice(suffix);
        buffer
    }

    fn decode_id(bytes: &[u8]) -> Result<u32> {
        if bytes.len() != 8 {
            return Err(CarmenError::Internal(
                "stored index id has the wrong size".to_string(),
            ));
        }
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()) as u32)
    }

    fn encode_id(id: u32) -> [u8; 8] {
        (id as u64).to_le_bytes()
    }

    fn next_id(&mut self) -> Result<u32> {
        if let Some(id) = self.next_id {
            return Ok(id);
        }
        let id = match self.kv.get(&self.sentinel(LAST_INDEX_SUFFIX))? {
            Some(bytes) => Self::decode_id(&bytes)?,
            None => 0,
        };
        self.next_id = Some(id);
        Ok(id)
    }

    fn stored_hash(&mut self) -> Result<Hash> {
        if let Some(hash) = self.hash {
            return Ok(hash);
        }
        let hash = match self.kv.get(&self.sentinel(HASH_SUFFIX))? {
            Some(bytes) if bytes.len() == 32 => bytes.try_into().unwrap(),
            Some(_) => {
                return Err(CarmenError::Internal(
                    "stored index hash has the wrong size".to_string(),
                ))
            }
            None => ZERO_HASH,
        };
        self.hash = Some(hash);
        Ok(hash)
    }
}

impl<K: IndexKey> Index<K> for KvIndex<K> {
    fn get_or_add(&mut self, key: &K) -> Result<(u32, bool)> {
        if let Some(id) = self.get(key)? {
            return Ok((id, false));
        }
        let id = self.next_id()?;
        self.kv.write_batch(&[
            (self.db_key(key), Self::encode_id(id).to_vec()),
            (
                self.sentinel(LAST_INDEX_SUFFIX),
                Self::encode_id(id + 1).to_vec(),
            ),
        ])?;
        self.next_id = Some(id + 1);
        self.unhashed.push(*key);
        Ok((id, true))
    }

    fn get(&mut self, key: &K) -> Result<Option<u32>> {
        match self.kv.get(&self.db_key(key))? {
            Some(bytes) => Ok(Some(Self::decode_id(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_hash(&mut self) -> Result<Hash> {
        let mut hash = self.stored_hash()?;
        if self.unhashed.is_empty() {
            return Ok(hash);
        }
        for key in std::mem::take(&mut self.unhashed) {
            hash = chain_hash(&hash, &key_bytes(&key));
        }
        self.kv.put(&self.sentinel(HASH_SUFFIX), &hash)?;
        self.hash = Some(hash);
        Ok(hash)
    }

    fn flush(&mut self) -> Result<()> {
        self.get_hash()?;
        self.kv.flush()
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::super::InMemoryIndex;
    use super::*;
    use carmen_types::{Address, Key};
    use tempfile::TempDir;

    fn address(seed: u8) -> Address {
        Address::new([seed; 20])
    }

    #[test]
    fn test_ids_are_dense_and_stable() {
        let dir = TempDir::new().unwrap();
        let mut context = Context::new();
        let mut index = KvIndex::<Address>::open(&mut context, dir.path(), b'A').unwrap();
        assert_eq!(index.get_or_add(&address(1)).unwrap(), (0, true));
        assert_eq!(index.get_or_add(&address(2)).unwrap(), (1, true));
        assert_eq!(index.get_or_add(&address(1)).unwrap(), (0, false));
        assert_eq!(index.get(&address(3)).unwrap(), None);
    }

    #[test]
    fn test_key_spaces_are_disjoint() {
        let dir = TempDir::new().unwrap();
        let mut context = Context::new();
        let mut addresses = KvIndex::<Address>::open(&mut context, dir.path(), b'A').unwrap();
        let mut keys = KvIndex::<Key>::open(&mut context, dir.path(), b'K').unwrap();

        addresses.get_or_add(&address(1)).unwrap();
        assert_eq!(keys.get_or_add(&Key::new([1u8; 32])).unwrap(), (0, true));
        assert_eq!(addresses.get_or_add(&address(2)).unwrap(), (1, true));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let hash;
        {
            let mut context = Context::new();
            let mut index = KvIndex::<Address>::open(&mut context, dir.path(), b'A').unwrap();
            for seed in 1..=50 {
                index.get_or_add(&address(seed)).unwrap();
            }
            hash = index.get_hash().unwrap();
            index.close().unwrap();
        }
        let mut context = Context::new();
        let mut index = KvIndex::<Address>::open(&mut context, dir.path(), b'A').unwrap();
        assert_eq!(index.get(&address(7)).unwrap(), Some(6));
        assert_eq!(index.get_hash().unwrap(), hash);
        assert_eq!(index.get_or_add(&address(99)).unwrap(), (50, true));
    }

    #[test]
    fn test_hash_agrees_with_memory_index() {
        let dir = TempDir::new().unwrap();
        let mut context = Context::new();
        let mut kv_index = KvIndex::<Address>::open(&mut context, dir.path(), b'A').unwrap();
        let mut memory_index = InMemoryIndex::<Address>::new();
        for seed in 1..=40 {
            kv_index.get_or_add(&address(seed)).unwrap();
            memory_index.get_or_add(&address(seed)).unwrap();
        }
        assert_eq!(
            kv_index.get_hash().unwrap(),
            memory_index.get_hash().unwrap()
        );
    }
}
