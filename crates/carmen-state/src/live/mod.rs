// The live state: the current world state, in contrast to the archive.

mod schema1;
mod schema3;

pub use schema1::Schema1State;
pub use schema3::Schema3State;

use carmen_archive::Archive;
use carmen_crypto::{keccak256, Hash};
use carmen_types::error::Result;
use carmen_types::{
    AccountState, Address, AddressId, Balance, BlockId, FixedBytes, Key, KeyId, Nonce,
    Reincarnation, Update, Value,
};

/// The persistent state of the chain: account balances, nonces, codes, and
/// storage.
///
/// Mutating operations on one instance must be externally serialized; the
/// getters also take `&mut self` because reads go through page pools and
/// caches.
pub trait State {
    fn create_account(&mut self, address: &Address) -> Result<()>;
    fn get_account_state(&mut self, address: &Address) -> Result<AccountState>;
    fn delete_account(&mut self, address: &Address) -> Result<()>;

    fn get_balance(&mut self, address: &Address) -> Result<Balance>;
    fn set_balance(&mut self, address: &Address, balance: Balance) -> Result<()>;

    fn get_nonce(&mut self, address: &Address) -> Result<Nonce>;
    fn set_nonce(&mut self, address: &Address, nonce: Nonce) -> Result<()>;

    /// The current value of the given storage slot; zero if never written.
    fn get_storage_value(&mut self, address: &Address, key: &Key) -> Result<Value>;
    fn set_storage_value(&mut self, address: &Address, key: &Key, value: Value) -> Result<()>;

    fn get_code(&mut self, address: &Address) -> Result<Vec<u8>>;
    fn set_code(&mut self, address: &Address, code: &[u8]) -> Result<()>;
    fn get_code_size(&mut self, address: &Address) -> Result<u32>;
    fn get_code_hash(&mut self, address: &Address) -> Result<Hash>;

    /// Applies a block update to this state and forwards it to the owned
    /// archive, if any.
    fn apply(&mut self, block: BlockId, update: &Update) -> Result<()>;

    /// Applies a block update to the current state only.
    ///
    /// The sub-phases execute in a fixed order: deletions, creations,
    /// balances, nonces, codes, storage. Creations after deletions allow an
    /// account to be re-created within the same block; codes before storage
    /// match the chain's execution semantics.
    fn apply_to_state(&mut self, update: &Update) -> Result<()> {
        for address in update.deleted_accounts() {
            self.delete_account(address)?;
        }
        for address in update.created_accounts() {
            self.create_account(address)?;
        }
        for (address, balance) in update.balances() {
            self.set_balance(address, *balance)?;
        }
        for (address, nonce) in update.nonces() {
            self.set_nonce(address, *nonce)?;
        }
        for (address, code) in update.codes() {
            self.set_code(address, code)?;
        }
        for (address, key, value) in update.storage() {
            self.set_storage_value(address, key, *value)?;
        }
        Ok(())
    }

    /// The owned archive, if the state was opened with one.
    fn archive(&self) -> Option<&dyn Archive>;

    /// A cryptographic fingerprint of the entire maintained state.
    fn get_hash(&mut self) -> Result<Hash>;

    /// Syncs internally buffered modifications to disk.
    fn flush(&mut self) -> Result<()>;

    /// Flushes and releases all resources. No further operations may be
    /// performed afterwards.
    fn close(&mut self) -> Result<()>;
}

/// The hash of the empty code, the default code hash of every account.
pub(crate) fn empty_code_hash() -> Hash {
    keccak256(&[])
}

/// Identifies a slot by the IDs of its address and key (schemas 1 and 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SlotIdPair {
    pub address: AddressId,
    pub key: KeyId,
}

impl FixedBytes for SlotIdPair {
    const LEN: usize = 8;

    fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.address.to_le_bytes());
        out[4..8].copy_from_slice(&self.key.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            address: AddressId::from_le_bytes(bytes[0..4].try_into().unwrap()),
            key: KeyId::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

/// Identifies a slot by its address ID and the full slot key (schema 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SlotKey {
    pub address: AddressId,
    pub key: Key,
}

impl FixedBytes for SlotKey {
    const LEN: usize = 4 + Key::LEN;

    fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.address.to_le_bytes());
        out[4..].copy_from_slice(self.key.as_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            address: AddressId::from_le_bytes(bytes[0..4].try_into().unwrap()),
            key: Key::from_slice(&bytes[4..]),
        }
    }
}

/// A slot value tagged with the account reincarnation it was written under
/// (schema 3). The value is observable only while the tag matches the
/// account's current reincarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotValue {
    pub reincarnation: Reincarnation,
    pub value: Value,
}

impl FixedBytes for SlotValue {
    const LEN: usize = 4 + Value::LEN;

    fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.reincarnation.to_le_bytes());
        out[4..].copy_from_slice(self.value.as_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            reincarnation: Reincarnation::from_le_bytes(bytes[0..4].try_into().unwrap()),
            value: Value::from_slice(&bytes[4..]),
        }
    }
}
