use std::path::Path;

use carmen_archive::{Archive, KvArchive, SqliteArchive};
use carmen_backend::{
    CachedDepot, CachedIndex, Context, Depot, FileDepot, FileIndex, Hashing, Index, IndexKey,
    InMemoryDepot, InMemoryIndex, KvDepot, KvIndex, KvStore, PagedStore, Store,
};
use carmen_types::error::{CarmenError, Result};
use carmen_types::FixedBytes;

use crate::live::{Schema1State, Schema3State, State};
use crate::mpt::MptState;

/// The state organization. Different schemas produce different state
/// hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    /// Address, key, and slot indexing; index hashes enter the state hash.
    One,
    /// Same layout as schema 1, with a reduced state-hash component set.
    Two,
    /// Address indexing with account reincarnation numbers.
    Three,
    /// Experimental in-memory Merkle Patricia trie forest.
    Four,
}

impl Schema {
    /// Maps the numeric schema selector; 0 is treated as schema 1.
    pub fn from_number(number: u8) -> Result<Schema> {
        match number {
            0 | 1 => Ok(Schema::One),
            2 => Ok(Schema::Two),
            3 => Ok(Schema::Three),
            4 => Ok(Schema::Four),
            _ => Err(CarmenError::InvalidArgument(format!(
                "unknown schema: {number}"
            ))),
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            Schema::One => 1,
            Schema::Two => 2,
            Schema::Three => 3,
            Schema::Four => 4,
        }
    }
}

/// The backend family carrying the live state's indexes, stores, and depot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateImpl {
    Memory,
    File,
    RocksDb,
}

/// The archive backend, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveImpl {
    None,
    RocksDb,
    Sqlite,
}

/// Key spaces of the shared index database used by the KV configuration.
const ADDRESS_KEY_SPACE: u8 = b'A';
const KEY_KEY_SPACE: u8 = b'K';
const SLOT_KEY_SPACE: u8 = b'S';

fn open_index<K: IndexKey + 'static>(
    state_impl: StateImpl,
    context: &mut Context,
    live: &Path,
    name: &str,
    key_space: u8,
) -> Result<Box<dyn Index<K>>> {
    match state_impl {
        StateImpl::Memory => Ok(Box::new(InMemoryIndex::new())),
        StateImpl::File => Ok(Box::new(CachedIndex::new(FileIndex::open(
            &live.join(name),
        )?))),
        // All indexes multiplex one database through per-type key spaces;
        // the shared handle comes from the context.
        StateImpl::RocksDb => Ok(Box::new(CachedIndex::new(KvIndex::open(
            context,
            &live.join("indexes"),
            key_space,
        )?))),
    }
}

fn open_store<V: FixedBytes + 'static>(
    state_impl: StateImpl,
    live: &Path,
    name: &str,
) -> Result<Box<dyn Store<V>>> {
    match state_impl {
        StateImpl::Memory => Ok(Box::new(PagedStore::in_memory())),
        StateImpl::File => Ok(Box::new(PagedStore::open(&live.join(name), Hashing::Eager)?)),
        StateImpl::RocksDb => Ok(Box::new(KvStore::open(&live.join(name))?)),
    }
}

fn open_depot(state_impl: StateImpl, live: &Path) -> Result<Box<dyn Depot>> {
    match state_impl {
        StateImpl::Memory => Ok(Box::new(InMemoryDepot::new())),
        StateImpl::File => Ok(Box::new(FileDepot::open(&live.join("codes"))?)),
        StateImpl::RocksDb => Ok(Box::new(CachedDepot::new(KvDepot::open(
            &live.join("codes"),
        )?))),
    }
}

fn open_archive(
    directory: &Path,
    archive_impl: ArchiveImpl,
) -> Result<Option<Box<dyn Archive>>> {
    let archive_dir = directory.join("archive");
    match archive_impl {
        ArchiveImpl::None => Ok(None),
        ArchiveImpl::RocksDb => Ok(Some(Box::new(KvArchive::open(&archive_dir)?))),
        ArchiveImpl::Sqlite => Ok(Some(Box::new(SqliteArchive::open(&archive_dir)?))),
    }
}

/// Opens a state in the given directory with the selected schema and
/// backends.
///
/// The on-disk layout places each component under `<dir>/live/<name>` and
/// the archive under `<dir>/archive`.
pub fn open_state(
    directory: &Path,
    schema: Schema,
    state_impl: StateImpl,
    archive_impl: ArchiveImpl,
) -> Result<Box<dyn State>> {
    tracing::info!(
        schema = schema.number(),
        ?state_impl,
        ?archive_impl,
        directory = %directory.display(),
        "opening state"
    );
    let live = directory.join("live");
    if state_impl != StateImpl::Memory {
        std::fs::create_dir_all(&live)?;
    }
    let mut context = Context::new();
    let archive = open_archive(directory, archive_impl)?;

    match schema {
        Schema::One | Schema::Two => Ok(Box::new(Schema1State::new(
            schema,
            open_index(state_impl, &mut context, &live, "addresses", ADDRESS_KEY_SPACE)?,
            open_index(state_impl, &mut context, &live, "keys", KEY_KEY_SPACE)?,
            open_index(state_impl, &mut context, &live, "slots", SLOT_KEY_SPACE)?,
            open_store(state_impl, &live, "balances")?,
            open_store(state_impl, &live, "nonces")?,
            open_store(state_impl, &live, "values")?,
            open_store(state_impl, &live, "account_states")?,
            open_depot(state_impl, &live)?,
            open_store(state_impl, &live, "code_hashes")?,
            archive,
        ))),
        Schema::Three => Ok(Box::new(Schema3State::new(
            open_index(state_impl, &mut context, &live, "addresses", ADDRESS_KEY_SPACE)?,
            open_index(state_impl, &mut context, &live, "slots", SLOT_KEY_SPACE)?,
            open_store(state_impl, &live, "balances")?,
            open_store(state_impl, &live, "nonces")?,
            open_store(state_impl, &live, "reincarnations")?,
            open_store(state_impl, &live, "values")?,
            open_store(state_impl, &live, "account_states")?,
            open_depot(state_impl, &live)?,
            open_store(state_impl, &live, "code_hashes")?,
            archive,
        ))),
        Schema::Four => {
            if state_impl != StateImpl::Memory {
                return Err(CarmenError::InvalidArgument(
                    "the trie schema only supports the in-memory backend".to_string(),
                ));
            }
            if archive_impl != ArchiveImpl::None {
                return Err(CarmenError::InvalidArgument(
                    "the trie schema does not support an archive".to_string(),
                ));
            }
            Ok(Box::new(MptState::new()))
        }
    }
}
