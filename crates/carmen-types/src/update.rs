use std::collections::BTreeMap;

use carmen_crypto::{sha256, Hash, Sha256Hasher};

use crate::error::{CarmenError, Result};
use crate::types::{Address, Balance, Key, Nonce, Value};

const VERSION_0: u8 = 0;

/// The update of a single storage slot within an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotUpdate {
    pub key: Key,
    pub value: Value,
}

/// An `Update` summarizes all state changes produced by processing one block.
///
/// It is the unit of data applied to the live state and appended to archives.
/// Its serialized form is hash-relevant and therefore fixed: all integer
/// fields are big-endian (see `to_bytes`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    deleted_accounts: Vec<Address>,
    created_accounts: Vec<Address>,
    balances: Vec<(Address, Balance)>,
    nonces: Vec<(Address, Nonce)>,
    codes: Vec<(Address, Vec<u8>)>,
    storage: Vec<(Address, Key, Value)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Mutators ---

    /// Adds the given account to the list of accounts deleted by this block.
    pub fn delete(&mut self, account: Address) {
        self.deleted_accounts.push(account);
    }

    /// Adds the given account to the list of accounts created by this block.
    /// Accounts may be deleted and re-created within the same update.
    pub fn create(&mut self, account: Address) {
        self.created_accounts.push(account);
    }

    pub fn set_balance(&mut self, account: Address, balance: Balance) {
        self.balances.push((account, balance));
    }

    pub fn set_nonce(&mut self, account: Address, nonce: Nonce) {
        self.nonces.push((account, nonce));
    }

    pub fn set_code(&mut self, account: Address, code: Vec<u8>) {
        self.codes.push((account, code));
    }

    pub fn set_storage(&mut self, account: Address, key: Key, value: Value) {
        self.storage.push((account, key, value));
    }

    // --- Observers ---

    pub fn deleted_accounts(&self) -> &[Address] {
        &self.deleted_accounts
    }

    pub fn created_accounts(&self) -> &[Address] {
        &self.created_accounts
    }

    pub fn balances(&self) -> &[(Address, Balance)] {
        &self.balances
    }

    pub fn nonces(&self) -> &[(Address, Nonce)] {
        &self.nonces
    }

    pub fn codes(&self) -> &[(Address, Vec<u8>)] {
        &self.codes
    }

    pub fn storage(&self) -> &[(Address, Key, Value)] {
        &self.storage
    }

    pub fn is_empty(&self) -> bool {
        self.deleted_accounts.is_empty()
            && self.created_accounts.is_empty()
            && self.balances.is_empty()
            && self.nonces.is_empty()
            && self.codes.is_empty()
            && self.storage.is_empty()
    }

    /// A fingerprint of the serialized update.
    pub fn hash(&self) -> Result<Hash> {
        Ok(sha256(&self.to_bytes()?))
    }

    // --- Serialization ---

    /// Encodes this update into its canonical byte string.
    ///
    /// Layout: version byte, six big-endian u32 list lengths (deleted,
    /// created, balances, codes, nonces, storage), followed by the lists in
    /// that order. Code entries carry a big-endian u16 length prefix.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut size = 1 + 6 * 4;
        size += self.deleted_accounts.len() * Address::LEN;
        size += self.created_accounts.len() * Address::LEN;
        size += self.balances.len() * (Address::LEN + Balance::LEN);
        size += self.nonces.len() * (Address::LEN + Nonce::LEN);
        size += self.storage.len() * (Address::LEN + Key::LEN + Value::LEN);
        for (_, code) in &self.codes {
            if code.len() > u16::MAX as usize {
                return Err(CarmenError::InvalidArgument(format!(
                    "code of {} bytes exceeds the 16-bit length limit",
                    code.len()
                )));
            }
            size += Address::LEN + 2 + code.len();
        }

        let mut out = Vec::with_capacity(size);
        out.push(VERSION_0);
        out.extend_from_slice(&(self.deleted_accounts.len() as u32).to_be_bytes());
        out.extend_from_slice(&(self.created_accounts.len() as u32).to_be_bytes());
        out.extend_from_slice(&(self.balances.len() as u32).to_be_bytes());
        out.extend_from_slice(&(self.codes.len() as u32).to_be_bytes());
        out.extend_from_slice(&(self.nonces.len() as u32).to_be_bytes());
        out.extend_from_slice(&(self.storage.len() as u32).to_be_bytes());

        for address in &self.deleted_accounts {
            out.extend_from_slice(address.as_bytes());
        }
        for address in &self.created_accounts {
            out.extend_from_slice(address.as_bytes());
        }
        for (address, balance) in &self.balances {
            out.extend_from_slice(address.as_bytes());
            out.extend_from_slice(balance.as_bytes());
        }
        for (address, code) in &self.codes {
            out.extend_from_slice(address.as_bytes());
            out.extend_from_slice(&(code.len() as u16).to_be_bytes());
            out.extend_from_slice(code);
        }
        for (address, nonce) in &self.nonces {
            out.extend_from_slice(address.as_bytes());
            out.extend_from_slice(nonce.as_bytes());
        }
        for (address, key, value) in &self.storage {
            out.extend_from_slice(address.as_bytes());
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(value.as_bytes());
        }

        debug_assert_eq!(out.len(), size);
        Ok(out)
    }

    /// Parses an encoded update. Unknown versions are rejected.
    pub fn from_bytes(data: &[u8]) -> Result<Update> {
        if data.len() < 1 + 6 * 4 {
            return Err(CarmenError::InvalidArgument(
                "encoded update is shorter than the minimum length".to_string(),
            ));
        }

        let mut reader = Reader::new(data);
        let version = reader.read_u8()?;
        if version != VERSION_0 {
            return Err(CarmenError::InvalidArgument(format!(
                "invalid update version number: {version}"
            )));
        }

        let num_deleted = reader.read_u32()? as usize;
        let num_created = reader.read_u32()? as usize;
        let num_balances = reader.read_u32()? as usize;
        let num_codes = reader.read_u32()? as usize;
        let num_nonces = reader.read_u32()? as usize;
        let num_storage = reader.read_u32()? as usize;

        let mut update = Update::new();
        for _ in 0..num_deleted {
            update.deleted_accounts.push(reader.read_address()?);
        }
        for _ in 0..num_created {
            update.created_accounts.push(reader.read_address()?);
        }
        for _ in 0..num_balances {
            let address = reader.read_address()?;
            let balance = Balance::from_slice(reader.read_bytes(Balance::LEN)?);
            update.balances.push((address, balance));
        }
        for _ in 0..num_codes {
            let address = reader.read_address()?;
            let len = reader.read_u16()? as usize;
            let code = reader.read_bytes(len)?.to_vec();
            update.codes.push((address, code));
        }
        for _ in 0..num_nonces {
            let address = reader.read_address()?;
            let nonce = Nonce::from_slice(reader.read_bytes(Nonce::LEN)?);
            update.nonces.push((address, nonce));
        }
        for _ in 0..num_storage {
            let address = reader.read_address()?;
            let key = Key::from_slice(reader.read_bytes(Key::LEN)?);
            let value = Value::from_slice(reader.read_bytes(Value::LEN)?);
            update.storage.push((address, key, value));
        }

        Ok(update)
    }
}

/// A cursor over an encoded update with bounds-checked reads.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(CarmenError::InvalidArgument(
                "unexpected end of encoded update".to_string(),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    fn read_address(&mut self) -> Result<Address> {
        Ok(Address::from_slice(self.read_bytes(Address::LEN)?))
    }
}

/// The projection of an [Update] onto a single account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountUpdate {
    pub created: bool,
    pub deleted: bool,
    pub balance: Option<Balance>,
    pub nonce: Option<Nonce>,
    pub code: Option<Vec<u8>>,
    pub storage: Vec<SlotUpdate>,
}

impl AccountUpdate {
    /// Projects a block update to per-account updates, keyed in address
    /// order. Slot updates retain their appearance order and are not yet
    /// normalized.
    pub fn from_update(update: &Update) -> BTreeMap<Address, AccountUpdate> {
        let mut result: BTreeMap<Address, AccountUpdate> = BTreeMap::new();
        for address in update.created_accounts() {
            result.entry(*address).or_default().created = true;
        }
        for address in update.deleted_accounts() {
            result.entry(*address).or_default().deleted = true;
        }
        for (address, balance) in update.balances() {
            result.entry(*address).or_default().balance = Some(*balance);
        }
        for (address, nonce) in update.nonces() {
            result.entry(*address).or_default().nonce = Some(*nonce);
        }
        for (address, code) in update.codes() {
            result.entry(*address).or_default().code = Some(code.clone());
        }
        for (address, key, value) in update.storage() {
            result
                .entry(*address)
                .or_default()
                .storage
                .push(SlotUpdate { key: *key, value: *value });
        }
        result
    }

    /// True if the slot updates are sorted by key without duplicates.
    pub fn is_normalized(&self) -> bool {
        self.storage.windows(2).all(|w| w[0].key < w[1].key)
    }

    /// Sorts slot updates by key and collapses duplicates. Fails if two
    /// entries share a key with different values.
    pub fn normalize(&mut self) -> Result<()> {
        self.storage.sort_by(|a, b| a.key.cmp(&b.key));
        self.storage.dedup();
        if !self.is_normalized() {
            return Err(CarmenError::InvalidArgument(
                "slot updates contain conflicting entries".to_string(),
            ));
        }
        Ok(())
    }

    /// Computes the hash of this account update.
    ///
    /// The hash covers a one-byte state-change flag (bit 0 created, bit 1
    /// deleted, bit 2 balance, bit 3 nonce, bit 4 code), the updated balance
    /// and nonce if present, the length-prefixed code if present (big-endian
    /// u32 length), and the normalized slot updates as (key, value) pairs.
    pub fn hash(&self) -> Hash {
        debug_assert!(self.is_normalized());
        let mut hasher = Sha256Hasher::new();
        let state_change: u8 = (self.created as u8)
            | (self.deleted as u8) << 1
            | (self.balance.is_some() as u8) << 2
            | (self.nonce.is_some() as u8) << 3
            | (self.code.is_some() as u8) << 4;
        hasher.ingest(&[state_change]);
        if let Some(balance) = &self.balance {
            hasher.ingest(balance.as_bytes());
        }
        if let Some(nonce) = &self.nonce {
            hasher.ingest(nonce.as_bytes());
        }
        if let Some(code) = &self.code {
            hasher.ingest(&(code.len() as u32).to_be_bytes());
            hasher.ingest(code);
        }
        for slot in &self.storage {
            hasher.ingest(slot.key.as_bytes());
            hasher.ingest(slot.value.as_bytes());
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(seed: u8) -> Address {
        Address::new([seed; 20])
    }

    fn key(seed: u8) -> Key {
        Key::new([seed; 32])
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut update = Update::new();
        update.create(address(0x01));
        update.delete(address(0x02));
        update.set_balance(address(0x03), Balance::from_u64(0xB1));
        update.set_nonce(address(0x04), Nonce::from_u64(0xA1));
        update.set_storage(address(0x05), key(0x06), Value::from_u64(0x07));
        update.set_code(address(0x06), vec![0x01, 0x02]);

        let bytes = update.to_bytes().unwrap();
        let restored = Update::from_bytes(&bytes).unwrap();
        assert_eq!(restored, update);
        assert_eq!(restored.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_wire_layout_is_big_endian() {
        let mut update = Update::new();
        update.set_code(address(0x0A), vec![0xC1, 0xC2, 0xC3]);
        let bytes = update.to_bytes().unwrap();

        // Version byte, then six u32 counts: deleted, created, balances,
        // codes, nonces, storage.
        assert_eq!(bytes[0], 0);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 0]);
        assert_eq!(&bytes[5..9], &[0, 0, 0, 0]);
        assert_eq!(&bytes[9..13], &[0, 0, 0, 0]);
        assert_eq!(&bytes[13..17], &[0, 0, 0, 1]);
        assert_eq!(&bytes[17..21], &[0, 0, 0, 0]);
        assert_eq!(&bytes[21..25], &[0, 0, 0, 0]);
        // Code entry: address, big-endian u16 length, code bytes.
        assert_eq!(&bytes[25..45], &[0x0A; 20]);
        assert_eq!(&bytes[45..47], &[0, 3]);
        assert_eq!(&bytes[47..50], &[0xC1, 0xC2, 0xC3]);
        assert_eq!(bytes.len(), 50);
    }

    #[test]
    fn test_empty_update_round_trip() {
        let update = Update::new();
        assert!(update.is_empty());
        let bytes = update.to_bytes().unwrap();
        assert_eq!(bytes.len(), 1 + 6 * 4);
        assert_eq!(Update::from_bytes(&bytes).unwrap(), update);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut bytes = Update::new().to_bytes().unwrap();
        bytes[0] = 1;
        assert!(matches!(
            Update::from_bytes(&bytes),
            Err(CarmenError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_truncated_update_is_rejected() {
        let mut update = Update::new();
        update.create(address(0x01));
        let bytes = update.to_bytes().unwrap();
        assert!(matches!(
            Update::from_bytes(&bytes[..bytes.len() - 1]),
            Err(CarmenError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_oversized_code_is_rejected() {
        let mut update = Update::new();
        update.set_code(address(0x01), vec![0; u16::MAX as usize + 1]);
        assert!(matches!(
            update.to_bytes(),
            Err(CarmenError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_projection_groups_by_account() {
        let mut update = Update::new();
        update.create(address(0x01));
        update.set_balance(address(0x01), Balance::from_u64(5));
        update.set_storage(address(0x01), key(0x02), Value::from_u64(9));
        update.set_nonce(address(0x03), Nonce::from_u64(7));

        let projected = AccountUpdate::from_update(&update);
        assert_eq!(projected.len(), 2);

        let first = &projected[&address(0x01)];
        assert!(first.created);
        assert_eq!(first.balance, Some(Balance::from_u64(5)));
        assert_eq!(first.storage.len(), 1);

        let second = &projected[&address(0x03)];
        assert_eq!(second.nonce, Some(Nonce::from_u64(7)));
        assert!(!second.created);
    }

    #[test]
    fn test_normalize_sorts_and_deduplicates() {
        let mut account_update = AccountUpdate {
            storage: vec![
                SlotUpdate { key: key(0x02), value: Value::from_u64(2) },
                SlotUpdate { key: key(0x01), value: Value::from_u64(1) },
                SlotUpdate { key: key(0x02), value: Value::from_u64(2) },
            ],
            ..Default::default()
        };
        account_update.normalize().unwrap();
        assert_eq!(account_update.storage.len(), 2);
        assert!(account_update.is_normalized());
    }

    #[test]
    fn test_normalize_rejects_conflicts() {
        let mut account_update = AccountUpdate {
            storage: vec![
                SlotUpdate { key: key(0x01), value: Value::from_u64(1) },
                SlotUpdate { key: key(0x01), value: Value::from_u64(2) },
            ],
            ..Default::default()
        };
        assert!(matches!(
            account_update.normalize(),
            Err(CarmenError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_account_update_hash_depends_on_flags() {
        let created = AccountUpdate { created: true, ..Default::default() };
        let deleted = AccountUpdate { deleted: true, ..Default::default() };
        assert_ne!(created.hash(), deleted.hash());
    }
}
