use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use carmen_backend::Kv;
use carmen_crypto::{chain_hash, keccak256, Hash, ZERO_HASH};
use carmen_types::error::{CarmenError, Result};
use carmen_types::{
    AccountUpdate, Address, Balance, BlockId, Key, Nonce, Reincarnation, Update, Value,
};

use crate::keys::{
    account_key, account_prefix, address_of, block_key, block_of, storage_key, storage_prefix,
    KIND_ACCOUNT_HASH, KIND_BALANCE, KIND_BLOCK, KIND_CODE, KIND_NONCE, KIND_STATUS, KIND_STORAGE,
};
use crate::verify::{apply_status, root_hash, verify_account_history, AccountHistory};
use crate::Archive;

/// An archive over an ordered KV store.
///
/// Facts are stored under composite big-endian keys (see [crate::keys]), so
/// the most recent record at or before a block is found with a single
/// seek-for-predecessor. The write path is serialized behind a write lock;
/// getters share a read lock.
pub struct KvArchive {
    inner: RwLock<Kv>,
    closed: AtomicBool,
}

impl KvArchive {
    pub fn open(directory: &Path) -> Result<Self> {
        std::fs::create_dir_all(directory)?;
        let kv = Kv::open(directory)?;
        Ok(Self {
            inner: RwLock::new(kv),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CarmenError::FailedPrecondition(
                "archive has been closed".to_string(),
            ));
        }
        Ok(())
    }

    fn latest_block(kv: &Kv) -> Result<Option<BlockId>> {
        match kv.seek_for_prev(&block_key(BlockId::MAX))? {
            Some((key, _)) if key.len() == 9 && key[0] == KIND_BLOCK => Ok(Some(block_of(&key))),
            _ => Ok(None),
        }
    }

    /// The most recent value stored under the prefix at or before `block`.
    fn most_recent(kv: &Kv, prefix: &[u8], block: BlockId) -> Result<Option<Vec<u8>>> {
        let mut key = prefix.to_vec();
        key.extend_from_slice(&block.to_be_bytes());
        match kv.seek_for_prev(&key)? {
            Some((found, value)) if found.len() == key.len() && found.starts_with(prefix) => {
                Ok(Some(value.into_vec()))
            }
            _ => Ok(None),
        }
    }

    fn status_at(kv: &Kv, block: BlockId, account: &Address) -> Result<(bool, Reincarnation)> {
        match Self::most_recent(kv, &account_prefix(KIND_STATUS, account), block)? {
            Some(value) if value.len() == 5 => {
                let reincarnation =
                    Reincarnation::from_be_bytes(value[1..5].try_into().unwrap());
                Ok((value[0] != 0, reincarnation))
            }
            Some(_) => Err(CarmenError::Internal(
                "stored account status has the wrong size".to_string(),
            )),
            None => Ok((false, 0)),
        }
    }

    fn encode_status(exists: bool, reincarnation: Reincarnation) -> Vec<u8> {
        let mut value = Vec::with_capacity(5);
        value.push(exists as u8);
        value.extend_from_slice(&reincarnation.to_be_bytes());
        value
    }

    fn account_hash_at(kv: &Kv, block: BlockId, account: &Address) -> Result<Hash> {
        match Self::most_recent(kv, &account_prefix(KIND_ACCOUNT_HASH, account), block)? {
            Some(value) if value.len() == 32 => Ok(value.try_into().unwrap()),
            Some(_) => Err(CarmenError::Internal(
                "stored account hash has the wrong size".to_string(),
            )),
            None => Ok(ZERO_HASH),
        }
    }

    fn collect_history(kv: &Kv, block: BlockId, account: &Address) -> Result<AccountHistory> {
        let mut history = AccountHistory::default();

        for (key, value) in kv.scan_prefix(&account_prefix(KIND_STATUS, account))? {
            if block_of(&key) > block {
                continue;
            }
            if value.len() != 5 {
                return Err(CarmenError::Internal("malformed status record".to_string()));
            }
            let reincarnation = Reincarnation::from_be_bytes(value[1..5].try_into().unwrap());
            history.status.push((block_of(&key), value[0] != 0, reincarnation));
        }
        for (key, value) in kv.scan_prefix(&account_prefix(KIND_BALANCE, account))? {
            if block_of(&key) > block {
                continue;
            }
            if value.len() != Balance::LEN {
                return Err(CarmenError::Internal("malformed balance record".to_string()));
            }
            history.balances.push((block_of(&key), Balance::from_slice(&value)));
        }
        for (key, value) in kv.scan_prefix(&account_prefix(KIND_NONCE, account))? {
            if block_of(&key) > block {
                continue;
            }
            if value.len() != Nonce::LEN {
                return Err(CarmenError::Internal("malformed nonce record".to_string()));
            }
            history.nonces.push((block_of(&key), Nonce::from_slice(&value)));
        }
        for (key, value) in kv.scan_prefix(&account_prefix(KIND_CODE, account))? {
            if block_of(&key) > block {
                continue;
            }
            if value.len() < 32 {
                return Err(CarmenError::Internal("malformed code record".to_string()));
            }
            let hash: Hash = value[..32].try_into().unwrap();
            history.codes.push((block_of(&key), hash, value[32..].to_vec()));
        }
        for (key, value) in kv.scan_prefix(&account_prefix(KIND_STORAGE, account))? {
            if block_of(&key) > block {
                continue;
            }
            // kind + address + slot key + reincarnation + block
            if key.len() != 1 + Address::LEN + Key::LEN + 4 + 8 || value.len() != Value::LEN {
                return Err(CarmenError::Internal("malformed storage record".to_string()));
            }
            let slot = Key::from_slice(&key[1 + Address::LEN..1 + Address::LEN + Key::LEN]);
            let reincarnation = Reincarnation::from_be_bytes(
                key[1 + Address::LEN + Key::LEN..1 + Address::LEN + Key::LEN + 4]
                    .try_into()
                    .unwrap(),
            );
            history.storage.push((
                block_of(&key),
                reincarnation,
                slot,
                Value::from_slice(&value),
            ));
        }
        for (key, value) in kv.scan_prefix(&account_prefix(KIND_ACCOUNT_HASH, account))? {
            if block_of(&key) > block {
                continue;
            }
            if value.len() != 32 {
                return Err(CarmenError::Internal("malformed hash record".to_string()));
            }
            history.hashes.push((block_of(&key), value[..].try_into().unwrap()));
        }

        // Storage rows come back ordered by slot key; the verifier wants
        // block order.
        history.storage.sort_by_key(|r| r.0);
        Ok(history)
    }
}

impl Archive for KvArchive {
    fn add(&self, block: BlockId, update: &Update) -> Result<()> {
        self.check_open()?;
        let kv = self.inner.write();

        if let Some(latest) = Self::latest_block(&kv)? {
            if block <= latest {
                return Err(CarmenError::FailedPrecondition(format!(
                    "block {block} is not after the latest recorded block {latest}"
                )));
            }
        }

        let mut batch: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for (address, account_update) in AccountUpdate::from_update(update).iter_mut() {
            account_update.normalize()?;

            let (exists, reincarnation) = Self::status_at(&kv, block, address)?;
            let (exists, reincarnation, changed) =
                apply_status(exists, reincarnation, account_update);
            if changed {
                batch.push((
                    account_key(KIND_STATUS, address, block),
                    Self::encode_status(exists, reincarnation),
                ));
            }

            if let Some(balance) = &account_update.balance {
                batch.push((
                    account_key(KIND_BALANCE, address, block),
                    balance.as_bytes().to_vec(),
                ));
            }
            if let Some(nonce) = &account_update.nonce {
                batch.push((
                    account_key(KIND_NONCE, address, block),
                    nonce.as_bytes().to_vec(),
                ));
            }
            if let Some(code) = &account_update.code {
                let mut value = Vec::with_capacity(32 + code.len());
                value.extend_from_slice(&keccak256(code));
                value.extend_from_slice(code);
                batch.push((account_key(KIND_CODE, address, block), value));
            }
            for slot in &account_update.storage {
                batch.push((
                    storage_key(address, &slot.key, reincarnation, block),
                    slot.value.as_bytes().to_vec(),
                ));
            }

            let previous = Self::account_hash_at(&kv, block, address)?;
            batch.push((
                account_key(KIND_ACCOUNT_HASH, address, block),
                chain_hash(&previous, &account_update.hash()).to_vec(),
            ));
        }
        batch.push((block_key(block), Vec::new()));
        debug!(block, records = batch.len(), "recording block update");
        kv.write_batch(&batch)
    }

    fn exists(&self, block: BlockId, account: &Address) -> Result<bool> {
        self.check_open()?;
        let kv = self.inner.read();
        Ok(Self::status_at(&kv, block, account)?.0)
    }

    fn get_balance(&self, block: BlockId, account: &Address) -> Result<Balance> {
        self.check_open()?;
        let kv = self.inner.read();
        match Self::most_recent(&kv, &account_prefix(KIND_BALANCE, account), block)? {
            Some(value) if value.len() == Balance::LEN => Ok(Balance::from_slice(&value)),
            Some(_) => Err(CarmenError::Internal(
                "stored balance has the wrong size".to_string(),
            )),
            None => Ok(Balance::zero()),
        }
    }

    fn get_nonce(&self, block: BlockId, account: &Address) -> Result<Nonce> {
        self.check_open()?;
        let kv = self.inner.read();
        match Self::most_recent(&kv, &account_prefix(KIND_NONCE, account), block)? {
            Some(value) if value.len() == Nonce::LEN => Ok(Nonce::from_slice(&value)),
            Some(_) => Err(CarmenError::Internal(
                "stored nonce has the wrong size".to_string(),
            )),
            None => Ok(Nonce::zero()),
        }
    }

    fn get_code(&self, block: BlockId, account: &Address) -> Result<Vec<u8>> {
        self.check_open()?;
        let kv = self.inner.read();
        match Self::most_recent(&kv, &account_prefix(KIND_CODE, account), block)? {
            Some(value) if value.len() >= 32 => Ok(value[32..].to_vec()),
            Some(_) => Err(CarmenError::Internal(
                "stored code has the wrong size".to_string(),
            )),
            None => Ok(Vec::new()),
        }
    }

    fn get_storage(&self, block: BlockId, account: &Address, key: &Key) -> Result<Value> {
        self.check_open()?;
        let kv = self.inner.read();
        let (_, reincarnation) = Self::status_at(&kv, block, account)?;
        match Self::most_recent(&kv, &storage_prefix(account, key, reincarnation), block)? {
            Some(value) if value.len() == Value::LEN => Ok(Value::from_slice(&value)),
            Some(_) => Err(CarmenError::Internal(
                "stored slot value has the wrong size".to_string(),
            )),
            None => Ok(Value::zero()),
        }
    }

    fn get_latest_block(&self) -> Result<BlockId> {
        self.check_open()?;
        let kv = self.inner.read();
        Ok(Self::latest_block(&kv)?.unwrap_or(0))
    }

    fn get_hash(&self, block: BlockId) -> Result<Hash> {
        self.check_open()?;
        let kv = self.inner.read();
        let mut hashes = Vec::new();
        for account in Self::account_list(&kv, block)? {
            hashes.push(Self::account_hash_at(&kv, block, &account)?);
        }
        Ok(root_hash(hashes))
    }

    fn get_account_list(&self, block: BlockId) -> Result<Vec<Address>> {
        self.check_open()?;
        let kv = self.inner.read();
        Self::account_list(&kv, block)
    }

    fn get_account_hash(&self, block: BlockId, account: &Address) -> Result<Hash> {
        self.check_open()?;
        let kv = self.inner.read();
        Self::account_hash_at(&kv, block, account)
    }

    fn verify(
        &self,
        block: BlockId,
        expected_hash: &Hash,
        progress: &mut dyn FnMut(&str),
    ) -> Result<()> {
        if self.get_hash(block)? != *expected_hash {
            return Err(CarmenError::Internal(
                "archive root hash does not match the expected hash".to_string(),
            ));
        }
        for account in self.get_account_list(block)? {
            self.verify_account(block, &account)?;
            progress(&account.to_string());
        }
        Ok(())
    }

    fn verify_account(&self, block: BlockId, account: &Address) -> Result<()> {
        self.check_open()?;
        let kv = self.inner.read();
        let history = Self::collect_history(&kv, block, account)?;
        verify_account_history(account, &history)
    }

    fn flush(&self) -> Result<()> {
        self.check_open()?;
        self.inner.read().flush()
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.read().flush()
    }
}

impl KvArchive {
    /// Accounts touched up to the given block, derived from the hash
    /// records, in address order.
    fn account_list(kv: &Kv, block: BlockId) -> Result<Vec<Address>> {
        let mut accounts = Vec::new();
        for (key, _) in kv.scan_prefix(&[KIND_ACCOUNT_HASH])? {
            if block_of(&key) > block {
                continue;
            }
            let address = address_of(&key);
            if accounts.last() != Some(&address) {
                accounts.push(address);
            }
        }
        Ok(accounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn address(seed: u8) -> Address {
        Address::new([seed; 20])
    }

    fn key(seed: u8) -> Key {
        Key::new([seed; 32])
    }

    fn open() -> (TempDir, KvArchive) {
        let dir = TempDir::new().unwrap();
        let archive = KvArchive::open(dir.path()).unwrap();
        (dir, archive)
    }

    #[test]
    fn test_empty_archive() {
        let (_dir, archive) = open();
        assert_eq!(archive.get_latest_block().unwrap(), 0);
        assert!(!archive.exists(5, &address(1)).unwrap());
        assert_eq!(archive.get_balance(5, &address(1)).unwrap(), Balance::zero());
        assert_eq!(archive.get_hash(5).unwrap(), ZERO_HASH);
        assert!(archive.get_account_list(5).unwrap().is_empty());
    }

    #[test]
    fn test_block_monotonicity() {
        let (_dir, archive) = open();
        archive.add(0, &Update::new()).unwrap();
        archive.add(2, &Update::new()).unwrap();
        assert!(matches!(
            archive.add(2, &Update::new()),
            Err(CarmenError::FailedPrecondition(_))
        ));
        assert!(matches!(
            archive.add(1, &Update::new()),
            Err(CarmenError::FailedPrecondition(_))
        ));
        assert_eq!(archive.get_latest_block().unwrap(), 2);
    }

    #[test]
    fn test_point_in_time_reads() {
        let (_dir, archive) = open();
        let account = address(1);
        let slot = key(2);

        let mut first = Update::new();
        first.create(account);
        first.set_balance(account, Balance::from_u64(0xB1));
        first.set_nonce(account, Nonce::from_u64(0xA1));
        first.set_code(account, vec![0xC1]);
        first.set_storage(account, slot, Value::from_u64(0x01));
        archive.add(1, &first).unwrap();

        let mut second = Update::new();
        second.delete(account);
        second.set_balance(account, Balance::from_u64(0xB2));
        second.set_nonce(account, Nonce::from_u64(0xA2));
        second.set_code(account, vec![0xC2]);
        second.set_storage(account, slot, Value::from_u64(0x02));
        archive.add(3, &second).unwrap();

        let expected_exists = [false, true, true, false, false];
        let expected_balance = [0u64, 0xB1, 0xB1, 0xB2, 0xB2];
        let expected_storage = [0u64, 0x01, 0x01, 0x02, 0x02];
        for block in 0..5u64 {
            assert_eq!(
                archive.exists(block, &account).unwrap(),
                expected_exists[block as usize],
                "exists at block {block}"
            );
            assert_eq!(
                archive.get_balance(block, &account).unwrap(),
                Balance::from_u64(expected_balance[block as usize]),
                "balance at block {block}"
            );
            assert_eq!(
                archive.get_storage(block, &account, &slot).unwrap(),
                Value::from_u64(expected_storage[block as usize]),
                "storage at block {block}"
            );
        }

        assert_eq!(archive.get_code(2, &account).unwrap(), vec![0xC1]);
        assert_eq!(archive.get_code(4, &account).unwrap(), vec![0xC2]);
        assert_eq!(archive.get_nonce(2, &account).unwrap(), Nonce::from_u64(0xA1));
    }

    #[test]
    fn test_recreation_clears_storage() {
        let (_dir, archive) = open();
        let account = address(1);
        let slot = key(2);

        let mut first = Update::new();
        first.create(account);
        first.set_storage(account, slot, Value::from_u64(7));
        archive.add(1, &first).unwrap();

        let mut second = Update::new();
        second.delete(account);
        second.create(account);
        archive.add(2, &second).unwrap();

        assert_eq!(archive.get_storage(1, &account, &slot).unwrap(), Value::from_u64(7));
        // After re-creation the old slot value is no longer visible.
        assert_eq!(archive.get_storage(2, &account, &slot).unwrap(), Value::zero());
        assert!(archive.exists(2, &account).unwrap());
    }

    #[test]
    fn test_account_list_and_hash_evolution() {
        let (_dir, archive) = open();
        let mut update = Update::new();
        update.set_balance(address(2), Balance::from_u64(1));
        update.set_balance(address(1), Balance::from_u64(2));
        archive.add(1, &update).unwrap();

        assert_eq!(
            archive.get_account_list(1).unwrap(),
            vec![address(1), address(2)]
        );

        let first = archive.get_hash(1).unwrap();
        assert_ne!(first, ZERO_HASH);

        let mut second = Update::new();
        second.set_balance(address(1), Balance::from_u64(3));
        archive.add(2, &second).unwrap();

        // The hash at the earlier block is unaffected by later additions.
        assert_eq!(archive.get_hash(1).unwrap(), first);
        assert_ne!(archive.get_hash(2).unwrap(), first);
    }

    #[test]
    fn test_operations_fail_after_close() {
        let (_dir, archive) = open();
        archive.add(1, &Update::new()).unwrap();
        archive.close().unwrap();
        assert!(matches!(
            archive.get_latest_block(),
            Err(CarmenError::FailedPrecondition(_))
        ));
        assert!(matches!(
            archive.add(2, &Update::new()),
            Err(CarmenError::FailedPrecondition(_))
        ));
        // Closing twice is harmless.
        archive.close().unwrap();
    }

    #[test]
    fn test_parallel_reads_during_writes() {
        let (_dir, archive) = open();
        let mut genesis = Update::new();
        genesis.create(address(1));
        genesis.set_balance(address(1), Balance::from_u64(1));
        archive.add(0, &genesis).unwrap();

        std::thread::scope(|scope| {
            let writer = scope.spawn(|| {
                for block in 1..=20u64 {
                    let mut update = Update::new();
                    update.set_balance(address(1), Balance::from_u64(block));
                    archive.add(block, &update).unwrap();
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        // Historic facts never change while blocks are
                        // appended concurrently.
                        assert!(archive.exists(0, &address(1)).unwrap());
                        assert_eq!(
                            archive.get_balance(0, &address(1)).unwrap(),
                            Balance::from_u64(1)
                        );
                    }
                });
            }
            writer.join().unwrap();
        });

        assert_eq!(archive.get_latest_block().unwrap(), 20);
        assert_eq!(
            archive.get_balance(20, &address(1)).unwrap(),
            Balance::from_u64(20)
        );
    }

    #[test]
    fn test_verify_accepts_own_content() {
        let (_dir, archive) = open();
        let account = address(1);
        let mut update = Update::new();
        update.create(account);
        update.set_balance(account, Balance::from_u64(5));
        update.set_code(account, vec![1, 2, 3]);
        update.set_storage(account, key(2), Value::from_u64(9));
        archive.add(1, &update).unwrap();

        let mut deletion = Update::new();
        deletion.delete(account);
        archive.add(4, &deletion).unwrap();

        let root = archive.get_hash(4).unwrap();
        let mut seen = Vec::new();
        archive
            .verify(4, &root, &mut |account| seen.push(account.to_string()))
            .unwrap();
        assert_eq!(seen.len(), 1);

        // A wrong expectation is rejected.
        assert!(archive.verify(4, &ZERO_HASH, &mut |_| {}).is_err());
    }
}
