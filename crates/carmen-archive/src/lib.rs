// Carmen archive
// Append-only, block-keyed log of state updates supporting point-in-time
// queries, per-block and per-account hashes, and end-to-end verification.

pub mod keys;
pub mod kv;
pub mod sqlite;
mod verify;

pub use kv::KvArchive;
pub use sqlite::SqliteArchive;

use carmen_crypto::Hash;
use carmen_types::error::Result;
use carmen_types::{Address, Balance, BlockId, Key, Nonce, Update, Value};

/// An archive retains the history of state mutations on block granularity.
///
/// Updates are append-only: a block can be added at most once, with strictly
/// increasing block numbers, and written history is never altered. `add` and
/// the getters are safe for parallel calls; implementations synchronize
/// internally.
pub trait Archive: Send + Sync {
    /// Records the changes of the given block. Fails with
    /// `FailedPrecondition` if the block number does not exceed the latest
    /// recorded block (an empty archive accepts any block, including 0).
    fn add(&self, block: BlockId, update: &Update) -> Result<()>;

    /// Whether the account exists at the given block height.
    fn exists(&self, block: BlockId, account: &Address) -> Result<bool>;

    /// The account's balance at the given block height; zero if never set.
    fn get_balance(&self, block: BlockId, account: &Address) -> Result<Balance>;

    /// The account's nonce at the given block height; zero if never set.
    fn get_nonce(&self, block: BlockId, account: &Address) -> Result<Nonce>;

    /// The account's code at the given block height; empty if never set.
    fn get_code(&self, block: BlockId, account: &Address) -> Result<Vec<u8>>;

    /// The slot's value at the given block height; zero if never set or
    /// cleared by a later account reincarnation.
    fn get_storage(&self, block: BlockId, account: &Address, key: &Key) -> Result<Value>;

    /// The largest recorded block, 0 if the archive is empty.
    fn get_latest_block(&self) -> Result<BlockId>;

    /// A fingerprint of the entire archive content through the given block.
    fn get_hash(&self, block: BlockId) -> Result<Hash>;

    /// All accounts touched up to the given block, in address order.
    fn get_account_list(&self, block: BlockId) -> Result<Vec<Address>>;

    /// A fingerprint of the single account's history through the given
    /// block.
    fn get_account_hash(&self, block: BlockId, account: &Address) -> Result<Hash>;

    /// Recomputes all hashes and internal invariants through the given
    /// block and compares the root against `expected_hash`. The progress
    /// callback is invoked with each verified account.
    fn verify(
        &self,
        block: BlockId,
        expected_hash: &Hash,
        progress: &mut dyn FnMut(&str),
    ) -> Result<()>;

    /// Verifies a single account's records through the given block.
    fn verify_account(&self, block: BlockId, account: &Address) -> Result<()>;

    fn flush(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
}
