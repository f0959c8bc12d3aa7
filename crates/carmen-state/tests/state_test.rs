//! End-to-end tests of the live state across schemas and backend
//! configurations.

use carmen_crypto::keccak256;
use carmen_state::{open_state, ArchiveImpl, HistoricView, Schema, StateImpl};
use carmen_types::{AccountState, Address, Balance, Key, Nonce, Update, Value};
use tempfile::TempDir;

fn address(seed: u8) -> Address {
    Address::new([seed; 20])
}

fn key(seed: u8) -> Key {
    Key::new([seed; 32])
}

const SCHEMAS: [Schema; 3] = [Schema::One, Schema::Two, Schema::Three];
const STATE_IMPLS: [StateImpl; 3] = [StateImpl::Memory, StateImpl::File, StateImpl::RocksDb];

#[test]
fn test_balance_round_trip_does_not_create_account() {
    for schema in SCHEMAS {
        for state_impl in STATE_IMPLS {
            let dir = TempDir::new().unwrap();
            let mut state = open_state(dir.path(), schema, state_impl, ArchiveImpl::None).unwrap();

            state
                .set_balance(&address(0x01), Balance::from_u64(0x12))
                .unwrap();
            assert_eq!(
                state.get_balance(&address(0x01)).unwrap(),
                Balance::from_u64(0x12),
                "{schema:?}/{state_impl:?}"
            );
            // Setting a balance does not create the account.
            assert_eq!(
                state.get_account_state(&address(0x01)).unwrap(),
                AccountState::Unknown
            );
            // Unknown addresses read as zero without allocating.
            assert_eq!(state.get_balance(&address(0x02)).unwrap(), Balance::zero());
        }
    }
}

#[test]
fn test_create_account_clears_storage() {
    for schema in SCHEMAS {
        for state_impl in STATE_IMPLS {
            let dir = TempDir::new().unwrap();
            let mut state = open_state(dir.path(), schema, state_impl, ArchiveImpl::None).unwrap();

            state
                .set_storage_value(&address(0x01), &key(0x02), Value::from_u64(0x03))
                .unwrap();
            assert_eq!(
                state
                    .get_storage_value(&address(0x01), &key(0x02))
                    .unwrap(),
                Value::from_u64(0x03)
            );

            state.create_account(&address(0x01)).unwrap();
            assert_eq!(
                state
                    .get_storage_value(&address(0x01), &key(0x02))
                    .unwrap(),
                Value::zero(),
                "{schema:?}/{state_impl:?}"
            );
        }
    }
}

#[test]
fn test_delete_account_clears_storage_and_allows_recreation() {
    for schema in SCHEMAS {
        let dir = TempDir::new().unwrap();
        let mut state =
            open_state(dir.path(), schema, StateImpl::Memory, ArchiveImpl::None).unwrap();

        state.create_account(&address(1)).unwrap();
        state
            .set_storage_value(&address(1), &key(2), Value::from_u64(3))
            .unwrap();
        state.delete_account(&address(1)).unwrap();

        assert_eq!(
            state.get_account_state(&address(1)).unwrap(),
            AccountState::Unknown
        );
        assert_eq!(
            state.get_storage_value(&address(1), &key(2)).unwrap(),
            Value::zero()
        );

        // Recreation starts with observably empty storage.
        state.create_account(&address(1)).unwrap();
        assert_eq!(
            state.get_account_state(&address(1)).unwrap(),
            AccountState::Exists
        );
        assert_eq!(
            state.get_storage_value(&address(1), &key(2)).unwrap(),
            Value::zero()
        );
    }
}

#[test]
fn test_code_hash_coherence() {
    for schema in SCHEMAS {
        let dir = TempDir::new().unwrap();
        let mut state =
            open_state(dir.path(), schema, StateImpl::Memory, ArchiveImpl::None).unwrap();

        // Unset codes report the hash of the empty code.
        assert_eq!(
            state.get_code_hash(&address(0x01)).unwrap(),
            keccak256(&[])
        );

        state.set_code(&address(0x01), &[0x12, 0x14]).unwrap();
        assert_eq!(
            state.get_code_hash(&address(0x01)).unwrap(),
            keccak256(&[0x12, 0x14])
        );
        assert_eq!(state.get_code(&address(0x01)).unwrap(), vec![0x12, 0x14]);
        assert_eq!(state.get_code_size(&address(0x01)).unwrap(), 2);

        state.set_code(&address(0x01), &[]).unwrap();
        assert_eq!(state.get_code_hash(&address(0x01)).unwrap(), keccak256(&[]));
        assert_eq!(state.get_code_size(&address(0x01)).unwrap(), 0);
    }
}

fn block_one_update() -> Update {
    let mut update = Update::new();
    update.create(address(1));
    update.set_balance(address(1), Balance::from_u64(0xB1));
    update.set_nonce(address(1), Nonce::from_u64(0xA1));
    update.set_code(address(1), vec![0xC1]);
    update.set_storage(address(1), key(2), Value::from_u64(0x01));
    update
}

fn block_three_update() -> Update {
    let mut update = Update::new();
    update.delete(address(1));
    update.set_balance(address(1), Balance::from_u64(0xB2));
    update.set_nonce(address(1), Nonce::from_u64(0xA2));
    update.set_code(address(1), vec![0xC2]);
    update.set_storage(address(1), key(2), Value::from_u64(0x02));
    update
}

#[test]
fn test_archive_point_in_time_queries() {
    for archive_impl in [ArchiveImpl::RocksDb, ArchiveImpl::Sqlite] {
        let dir = TempDir::new().unwrap();
        let mut state =
            open_state(dir.path(), Schema::Three, StateImpl::Memory, archive_impl).unwrap();

        state.apply(1, &block_one_update()).unwrap();
        state.apply(3, &block_three_update()).unwrap();

        let archive = state.archive().expect("archive configured");
        assert_eq!(archive.get_latest_block().unwrap(), 3);

        let expected_exists = [false, true, true, false, false];
        let expected_balance = [0u64, 0xB1, 0xB1, 0xB2, 0xB2];
        let expected_storage = [0u64, 0x01, 0x01, 0x02, 0x02];
        for block in 0..5u64 {
            assert_eq!(
                archive.exists(block, &address(1)).unwrap(),
                expected_exists[block as usize],
                "{archive_impl:?} exists at block {block}"
            );
            assert_eq!(
                archive.get_balance(block, &address(1)).unwrap(),
                Balance::from_u64(expected_balance[block as usize]),
                "{archive_impl:?} balance at block {block}"
            );
            assert_eq!(
                archive.get_storage(block, &address(1), &key(2)).unwrap(),
                Value::from_u64(expected_storage[block as usize]),
                "{archive_impl:?} storage at block {block}"
            );
        }

        // The archive verifies end to end against its own root.
        let root = archive.get_hash(3).unwrap();
        archive.verify(3, &root, &mut |_| {}).unwrap();
    }
}

#[test]
fn test_historic_views_match_replayed_state() {
    let dir = TempDir::new().unwrap();
    let mut state = open_state(
        dir.path(),
        Schema::One,
        StateImpl::Memory,
        ArchiveImpl::RocksDb,
    )
    .unwrap();
    state.apply(1, &block_one_update()).unwrap();
    state.apply(3, &block_three_update()).unwrap();

    // Replaying only block 1 on a fresh state must agree with the archive
    // view at heights 1 and 2.
    let replay_dir = TempDir::new().unwrap();
    let mut replayed = open_state(
        replay_dir.path(),
        Schema::One,
        StateImpl::Memory,
        ArchiveImpl::None,
    )
    .unwrap();
    replayed.apply(1, &block_one_update()).unwrap();

    let archive = state.archive().unwrap();
    for block in [1u64, 2] {
        let view = HistoricView::new(archive, block);
        assert_eq!(
            view.get_balance(&address(1)).unwrap(),
            replayed.get_balance(&address(1)).unwrap()
        );
        assert_eq!(
            view.get_nonce(&address(1)).unwrap(),
            replayed.get_nonce(&address(1)).unwrap()
        );
        assert_eq!(
            view.get_code(&address(1)).unwrap(),
            replayed.get_code(&address(1)).unwrap()
        );
        assert_eq!(
            view.get_code_hash(&address(1)).unwrap(),
            replayed.get_code_hash(&address(1)).unwrap()
        );
        assert_eq!(
            view.get_storage_value(&address(1), &key(2)).unwrap(),
            replayed.get_storage_value(&address(1), &key(2)).unwrap()
        );
    }
}

#[test]
fn test_state_hash_agreement_across_backends() {
    for schema in SCHEMAS {
        let mut hashes = Vec::new();
        for state_impl in STATE_IMPLS {
            let dir = TempDir::new().unwrap();
            let mut state = open_state(dir.path(), schema, state_impl, ArchiveImpl::None).unwrap();

            state.apply(1, &block_one_update()).unwrap();
            let mut second = Update::new();
            second.create(address(2));
            second.set_balance(address(2), Balance::from_u64(7));
            second.set_storage(address(2), key(9), Value::from_u64(4));
            state.apply(2, &second).unwrap();

            hashes.push((state_impl, state.get_hash().unwrap()));
        }
        let reference = hashes[0].1;
        for (state_impl, hash) in &hashes {
            assert_eq!(
                *hash, reference,
                "{schema:?}/{state_impl:?} diverges from the memory backend"
            );
        }
    }
}

#[test]
fn test_schemas_produce_distinct_hashes() {
    let mut hashes = Vec::new();
    for schema in SCHEMAS {
        let dir = TempDir::new().unwrap();
        let mut state =
            open_state(dir.path(), schema, StateImpl::Memory, ArchiveImpl::None).unwrap();
        state.apply(1, &block_one_update()).unwrap();
        hashes.push(state.get_hash().unwrap());
    }
    assert_ne!(hashes[0], hashes[1]);
    assert_ne!(hashes[0], hashes[2]);
    assert_ne!(hashes[1], hashes[2]);
}

#[test]
fn test_update_application_order_allows_recreate_in_same_block() {
    for schema in SCHEMAS {
        let dir = TempDir::new().unwrap();
        let mut state =
            open_state(dir.path(), schema, StateImpl::Memory, ArchiveImpl::None).unwrap();

        state.create_account(&address(1)).unwrap();
        state
            .set_storage_value(&address(1), &key(2), Value::from_u64(3))
            .unwrap();

        // One update deleting and re-creating the account: deletions run
        // before creations, so the account survives with cleared storage.
        let mut update = Update::new();
        update.delete(address(1));
        update.create(address(1));
        update.set_balance(address(1), Balance::from_u64(5));
        state.apply(1, &update).unwrap();

        assert_eq!(
            state.get_account_state(&address(1)).unwrap(),
            AccountState::Exists
        );
        assert_eq!(
            state.get_storage_value(&address(1), &key(2)).unwrap(),
            Value::zero()
        );
        assert_eq!(
            state.get_balance(&address(1)).unwrap(),
            Balance::from_u64(5)
        );
    }
}

#[test]
fn test_file_state_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let hash;
    {
        let mut state = open_state(
            dir.path(),
            Schema::One,
            StateImpl::File,
            ArchiveImpl::None,
        )
        .unwrap();
        state.apply(1, &block_one_update()).unwrap();
        hash = state.get_hash().unwrap();
        state.close().unwrap();
    }
    let mut state = open_state(
        dir.path(),
        Schema::One,
        StateImpl::File,
        ArchiveImpl::None,
    )
    .unwrap();
    assert_eq!(
        state.get_balance(&address(1)).unwrap(),
        Balance::from_u64(0xB1)
    );
    assert_eq!(state.get_code(&address(1)).unwrap(), vec![0xC1]);
    assert_eq!(state.get_hash().unwrap(), hash);
}

#[test]
fn test_rocksdb_state_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let hash;
    {
        let mut state = open_state(
            dir.path(),
            Schema::Three,
            StateImpl::RocksDb,
            ArchiveImpl::None,
        )
        .unwrap();
        state.apply(1, &block_one_update()).unwrap();
        hash = state.get_hash().unwrap();
        state.close().unwrap();
    }
    let mut state = open_state(
        dir.path(),
        Schema::Three,
        StateImpl::RocksDb,
        ArchiveImpl::None,
    )
    .unwrap();
    assert_eq!(
        state.get_storage_value(&address(1), &key(2)).unwrap(),
        Value::from_u64(0x01)
    );
    assert_eq!(state.get_hash().unwrap(), hash);
}

#[test]
fn test_archive_hash_agreement_across_backends() {
    let mut roots = Vec::new();
    for archive_impl in [ArchiveImpl::RocksDb, ArchiveImpl::Sqlite] {
        let dir = TempDir::new().unwrap();
        let mut state =
            open_state(dir.path(), Schema::One, StateImpl::Memory, archive_impl).unwrap();
        state.apply(1, &block_one_update()).unwrap();
        state.apply(3, &block_three_update()).unwrap();
        roots.push(state.archive().unwrap().get_hash(3).unwrap());
    }
    assert_eq!(roots[0], roots[1]);
}

#[test]
fn test_trie_schema_is_memory_only() {
    let dir = TempDir::new().unwrap();
    assert!(open_state(dir.path(), Schema::Four, StateImpl::File, ArchiveImpl::None).is_err());
    assert!(
        open_state(dir.path(), Schema::Four, StateImpl::Memory, ArchiveImpl::RocksDb).is_err()
    );

    let mut state = open_state(
        dir.path(),
        Schema::Four,
        StateImpl::Memory,
        ArchiveImpl::None,
    )
    .unwrap();
    state.apply(1, &block_one_update()).unwrap();
    assert_eq!(
        state.get_balance(&address(1)).unwrap(),
        Balance::from_u64(0xB1)
    );
    assert_ne!(state.get_hash().unwrap(), [0u8; 32]);
}
