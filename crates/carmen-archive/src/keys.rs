//! Composite key encoding for the ordered-KV archive backend.
//!
//! Every stored fact is addressed by `(kind, address, [slot key,]
//! [reincarnation,] block)` with all integers big-endian, so lexicographic
//! key order matches block order and point-in-time reads reduce to a single
//! seek to the greatest key at or below the query position.

use carmen_types::{Address, BlockId, Key, Reincarnation};

/// Record kind tags, ordering the key space by record type first.
pub const KIND_BLOCK: u8 = 0x01;
pub const KIND_STATUS: u8 = 0x02;
pub const KIND_BALANCE: u8 = 0x03;
pub const KIND_NONCE: u8 = 0x04;
pub const KIND_CODE: u8 = 0x05;
pub const KIND_STORAGE: u8 = 0x06;
pub const KIND_ACCOUNT_HASH: u8 = 0x07;

/// Key marking the presence of a block: `kind + block`.
pub fn block_key(block: BlockId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(KIND_BLOCK);
    key.extend_from_slice(&block.to_be_bytes());
    key
}

/// Prefix shared by all per-account records of one kind: `kind + address`.
pub fn account_prefix(kind: u8, account: &Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + Address::LEN);
    key.push(kind);
    key.extend_from_slice(account.as_bytes());
    key
}

/// Key of a per-account record: `kind + address + block`.
pub fn account_key(kind: u8, account: &Address, block: BlockId) -> Vec<u8> {
    let mut key = account_prefix(kind, account);
    key.extend_from_slice(&block.to_be_bytes());
    key
}

/// Prefix of a storage slot's records:
/// `kind + address + slot key + reincarnation`.
pub fn storage_prefix(account: &Address, key: &Key, reincarnation: Reincarnation) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(1 + Address::LEN + Key::LEN + 4);
    buffer.push(KIND_STORAGE);
    buffer.extend_from_slice(account.as_bytes());
    buffer.extend_from_slice(key.as_bytes());
    buffer.extend_from_slice(&reincarnation.to_be_bytes());
    buffer
}

/// Key of a storage record: the storage prefix plus the block.
pub fn storage_key(
    account: &Address,
    key: &Key,
    reincarnation: Reincarnation,
    block: BlockId,
) -> Vec<u8> {
    let mut buffer = storage_prefix(account, key, reincarnation);
    buffer.extend_from_slice(&block.to_be_bytes());
    buffer
}

/// Extracts the trailing block number of any composite key.
pub fn block_of(key: &[u8]) -> BlockId {
    let start = key.len() - 8;
    BlockId::from_be_bytes(key[start..].try_into().unwrap())
}

/// Extracts the address of a per-account record key.
pub fn address_of(key: &[u8]) -> Address {
    Address::from_slice(&key[1..1 + Address::LEN])
}
