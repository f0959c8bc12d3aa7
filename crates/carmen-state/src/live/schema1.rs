use carmen_archive::Archive;
use carmen_backend::{Depot, Index, InMemoryMultiMap, Store};
use carmen_crypto::{keccak256, Hash, Sha256Hasher, ZERO_HASH};
use carmen_types::error::Result;
use carmen_types::{AccountState, Address, AddressId, Balance, BlockId, Key, Nonce, Update, Value};

use super::{empty_code_hash, SlotIdPair, State};
use crate::config::Schema;

/// Live state for schemas 1 and 2: addresses, keys, and slots are all
/// indexed, and the set of non-zero slots per account is tracked in a
/// multimap so clearing an account touches only its occupied slots.
///
/// The two schemas share this layout; they differ only in which component
/// hashes enter the state hash.
pub struct Schema1State {
    schema: Schema,
    address_index: Box<dyn Index<Address>>,
    key_index: Box<dyn Index<Key>>,
    slot_index: Box<dyn Index<SlotIdPair>>,
    balances: Box<dyn Store<Balance>>,
    nonces: Box<dyn Store<Nonce>>,
    values: Box<dyn Store<Value>>,
    account_states: Box<dyn Store<AccountState>>,
    codes: Box<dyn Depot>,
    code_hashes: Box<dyn Store<Hash>>,
    address_to_slots: InMemoryMultiMap,
    archive: Option<Box<dyn Archive>>,
}

impl Schema1State {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        schema: Schema,
        address_index: Box<dyn Index<Address>>,
        key_index: Box<dyn Index<Key>>,
        slot_index: Box<dyn Index<SlotIdPair>>,
        balances: Box<dyn Store<Balance>>,
        nonces: Box<dyn Store<Nonce>>,
        values: Box<dyn Store<Value>>,
        account_states: Box<dyn Store<AccountState>>,
        codes: Box<dyn Depot>,
        code_hashes: Box<dyn Store<Hash>>,
        archive: Option<Box<dyn Archive>>,
    ) -> Self {
        debug_assert!(matches!(schema, Schema::One | Schema::Two));
        Self {
            schema,
            address_index,
            key_index,
            slot_index,
            balances,
            nonces,
            values,
            account_states,
            codes,
            code_hashes,
            address_to_slots: InMemoryMultiMap::new(),
            archive,
        }
    }

    /// Resets all occupied slots of the account to zero and drops its slot
    /// set.
    fn clear_account(&mut self, address_id: AddressId) -> Result<()> {
        let mut slots = Vec::new();
        self.address_to_slots
            .for_each(address_id, |slot| slots.push(slot))?;
        for slot in slots {
            self.values.set(slot, Value::zero())?;
        }
        self.address_to_slots.erase_key(address_id)
    }
}

impl State for Schema1State {
    fn create_account(&mut self, address: &Address) -> Result<()> {
        let (address_id, _) = self.address_index.get_or_add(address)?;
        self.account_states.set(address_id, AccountState::Exists)?;
        self.clear_account(address_id)
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
        self.clear_account(address_id)
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
        let Some(key_id) = self.key_index.get(key)? else {
            return Ok(Value::zero());
        };
        let slot = SlotIdPair { address: address_id, key: key_id };
        match self.slot_index.get(&slot)? {
            Some(slot_id) => self.values.get(slot_id),
            None => Ok(Value::zero()),
        }
    }

    fn set_storage_value(&mut self, address: &Address, key: &Key, value: Value) -> Result<()> {
        let (address_id, _) = self.address_index.get_or_add(address)?;
        let (key_id, _) = self.key_index.get_or_add(key)?;
        let slot = SlotIdPair { address: address_id, key: key_id };
        let (slot_id, _) = self.slot_index.get_or_add(&slot)?;
        self.values.set(slot_id, value)?;
        // Track which slots hold non-zero values per account.
        if value.is_zero() {
            self.address_to_slots.erase(address_id, slot_id)?;
        } else {
            self.address_to_slots.insert(address_id, slot_id)?;
        }
        Ok(())
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
        // The store's default is the zero hash, while unset codes must
        // report the hash of the empty code. An actual code hashing to zero
        // is the only (astronomically unlikely) exception.
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
        if self.schema == Schema::One {
            hasher.ingest(&self.key_index.get_hash()?);
            hasher.ingest(&self.slot_index.get_hash()?);
        }
        hasher.ingest(&self.balances.get_hash()?);
        hasher.ingest(&self.nonces.get_hash()?);
        hasher.ingest(&self.values.get_hash()?);
        hasher.ingest(&self.account_states.get_hash()?);
        hasher.ingest(&self.codes.get_hash()?);
        Ok(hasher.finish())
    }

    fn flush(&mut self) -> Result<()> {
        self.address_index.flush()?;
        self.key_index.flush()?;
        self.slot_index.flush()?;
        self.account_states.flush()?;
        self.balances.flush()?;
        self.nonces.flush()?;
        self.values.flush()?;
        self.codes.flush()?;
        self.code_hashes.flush()?;
        self.address_to_slots.flush()?;
        if let Some(archive) = &self.archive {
            archive.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.address_index.close()?;
        self.key_index.close()?;
        self.slot_index.close()?;
        self.account_states.close()?;
        self.balances.close()?;
        self.nonces.close()?;
        self.values.close()?;
        self.codes.close()?;
        self.code_hashes.close()?;
        self.address_to_slots.close()?;
        if let Some(archive) = &self.archive {
            archive.close()?;
        }
        Ok(())
    }
}
