use carmen_archive::Archive;
use carmen_backend::{Depot, Index, Store};
use carmen_crypto::{keccak256, Hash, Sha256Hasher, ZERO_HASH};
use carmen_types::error::Result;
use carmen_types::{
    AccountState, Address, Balance, BlockId, Key, Nonce, Reincarnation, Update, Value,
};

use super::{empty_code_hash, SlotKey, SlotValue, State};

/// Live state for schema 3: addresses are indexed but slot keys are not, and
/// deleted accounts are purged lazily through per-account reincarnation
/// numbers instead of slot iteration.
///
/// Every stored slot value carries the reincarnation it was written under; a
/// value is observable only while that tag matches the account's current
/// reincarnation, so create/delete invalidate all storage by a single
/// counter bump.
pub struct Schema3State {
    address_index: Box<dyn Index<Address>>,
    slot_index: Box<dyn Index<SlotKey>>,
    balances: Box<dyn Store<Balance>>,
    nonces: Box<dyn Store<Nonce>>,
    reincarnations: Box<dyn Store<Reincarnation>>,
    values: Box<dyn Store<SlotValue>>,
    account_states: Box<dyn Store<AccountState>>,
    codes: Box<dyn Depot>,
    code_hashes: Box<dyn Store<Hash>>,
    archive: Option<Box<dyn Archive>>,
}

impl Schema3State {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        address_index: Box<dyn Index<Address>>,
        slot_index: Box<dyn Index<SlotKey>>,
        balances: Box<dyn Store<Balance>>,
        nonces: Box<dyn Store<Nonce>>,
        reincarnations: Box<dyn Store<Reincarnation>>,
        values: Box<dyn Store<SlotValue>>,
        account_states: Box<dyn Store<AccountState>>,
        codes: Box<dyn Depot>,
        code_hashes: Box<dyn Store<Hash>>,
        archive: Option<Box<dyn Archive>>,
    ) -> Self {
        Self {
            address_index,
            slot_index,
            balances,
            nonces,
            reincarnations,
            values,
            account_states,
            codes,
            code_hashes,
            archive,
        }
    }
}

impl State for Schema3State {
    fn create_account(&mut self, address: &Address) -> Result<()> {
        let (address_id, _) = self.address_index.get_or_add(address)?;
        self.account_states.set(address_id, AccountState::Exists)?;
        let reincarnation = self.reincarnations.get(address_id)?;
        self.reincarnations.set(address_id, reincarnation + 1)
    }

    fn get_account_state(&mut self, address: &Address) -> Result<AccountState> {
        match self.address_index.get(address)? {
            Some(address_id) => self.account_states.get(address_id),
            None => Ok(AccountState::Unknown),
        }
    }

    fn delete_account(&mut self, address: &Address) -> Result<()> {
        let Some(address_id) = self.address_index.get(address)? else {
            return Ok(());
        };
        self.account_states.set(address_id, AccountState::Unknown)?;
        let reincarnation = self.reincarnations.get(address_id)?;
        self.reincarnations.set(address_id, reincarnation + 1)
    }

    fn get_balance(&mut self, address: &Address) -> Result<Balance> {
        match self.address_index.get(address)? {
            Some(address_id) => self.balances.get(address_id),
            None => Ok(Balance::zero()),
        }
    }

    fn set_balance(&mut self, address: &Address, balance: Balance) -> Result<()> {
        let (address_id, _) = self.address_index.get_or_add(address)?;
        self.balances.set(address_id, balance)
    }

    fn get_nonce(&mut self, address: &Address) -> Result<Nonce> {
        match self.address_index.get(address)? {
            Some(address_id) => self.nonces.get(address_id),
            None => Ok(Nonce::zero()),
        }
    }

    fn set_nonce(&mut self, address: &Address, nonce: Nonce) -> Result<()> {
        let (address_id, _) = self.address_index.get_or_add(address)?;
        self.nonces.set(address_id, nonce)
    }

    fn get_storage_value(&mut self, address: &Address, key: &Key) -> Result<Value> {
        let Some(address_id) = self.address_index.get(address)? else {
            return Ok(Value::zero());
        };
        let slot = SlotKey { address: address_id, key: *key };
        let Some(slot_id) = self.slot_index.get(&slot)? else {
            return Ok(Value::zero());
        };
        let stored = self.values.get(slot_id)?;
        // Values written before the account's last create/delete are stale.
        if stored.reincarnation == self.reincarnations.get(address_id)? {
            Ok(stored.value)
        } else {
            Ok(Value::zero())
        }
    }

    fn set_storage_value(&mut self, address: &Address, key: &Key, value: Value) -> Result<()> {
        let (address_id, _) = self.address_index.get_or_add(address)?;
        let slot = SlotKey { address: address_id, key: *key };
        let (slot_id, _) = self.slot_index.get_or_add(&slot)?;
        let reincarnation = self.reincarnations.get(address_id)?;
        self.values.set(slot_id, SlotValue { reincarnation, value })
    }

    fn get_code(&mut self, address: &Address) -> Result<Vec<u8>> {
        match self.address_index.get(address)? {
            Some(address_id) => Ok(self.codes.get(address_id)?.unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    fn set_code(&mut self, address: &Address, code: &[u8]) -> Result<()> {
        let (address_id, _) = self.address_index.get_or_add(address)?;
        self.codes.set(address_id, code)?;
        let code_hash = if code.is_empty() { empty_code_hash() } else { keccak256(code) };
        self.code_hashes.set(address_id, code_hash)
    }

    fn get_code_size(&mut self, address: &Address) -> Result<u32> {
        match self.address_index.get(address)? {
            Some(address_id) => Ok(self.codes.size(address_id)?.unwrap_or(0)),
            None => Ok(0),
        }
    }

    fn get_code_hash(&mut self, address: &Address) -> Result<Hash> {
        let Some(address_id) = self.address_index.get(address)? else {
            return Ok(empty_code_hash());
        };
        let code_hash = self.code_hashes.get(address_id)?;
        if code_hash == ZERO_HASH && self.codes.size(address_id)?.unwrap_or(0) == 0 {
            return Ok(empty_code_hash());
        }
        Ok(code_hash)
    }

    fn apply(&mut self, block: BlockId, update: &Update) -> Result<()> {
        self.apply_to_state(update)?;
        if let Some(archive) = &self.archive {
            archive.add(block, update)?;
        }
        Ok(())
    }

    fn archive(&self) -> Option<&dyn Archive> {
        self.archive.as_deref()
    }

    fn get_hash(&mut self) -> Result<Hash> {
        let mut hasher = Sha256Hasher::new();
        hasher.ingest(&self.address_index.get_hash()?);
        hasher.ingest(&self.slot_index.get_hash()?);
        hasher.ingest(&self.balances.get_hash()?);
        hasher.ingest(&self.nonces.get_hash()?);
        hasher.ingest(&self.reincarnations.get_hash()?);
        hasher.ingest(&self.values.get_hash()?);
        hasher.ingest(&self.account_states.get_hash()?);
        hasher.ingest(&self.codes.get_hash()?);
        Ok(hasher.finish())
    }

    fn flush(&mut self) -> Result<()> {
        self.address_index.flush()?;
        self.slot_index.flush()?;
        self.account_states.flush()?;
        self.balances.flush()?;
        self.nonces.flush()?;
        self.reincarnations.flush()?;
        self.values.flush()?;
        self.codes.flush()?;
        self.code_hashes.flush()?;
        if let Some(archive) = &self.archive {
            archive.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.address_index.close()?;
        self.slot_index.close()?;
        self.account_states.close()?;
        self.balances.close()?;
        self.nonces.close()?;
        self.reincarnations.close()?;
        self.values.close()?;
        self.codes.close()?;
        self.code_hashes.close()?;
        if let Some(archive) = &self.archive {
            archive.close()?;
        }
        Ok(())
    }
}
