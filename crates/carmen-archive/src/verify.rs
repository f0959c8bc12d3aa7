//! Backend-neutral archive verification: per-account histories are collected
//! by the backends and checked here against the stored hash chains and the
//! reincarnation/code coherence invariants.

use std::collections::BTreeSet;

use carmen_crypto::{chain_hash, keccak256, Hash, ZERO_HASH};
use carmen_types::error::{CarmenError, Result};
use carmen_types::{
    AccountUpdate, Address, Balance, BlockId, Key, Nonce, Reincarnation, SlotUpdate, Value,
};

/// Applies an account update's create/delete flags to the account status.
/// Returns the new `(exists, reincarnation)` pair and whether it changed.
pub(crate) fn apply_status(
    exists: bool,
    reincarnation: Reincarnation,
    update: &AccountUpdate,
) -> (bool, Reincarnation, bool) {
    let mut exists = exists;
    let mut reincarnation = reincarnation;
    let mut changed = false;
    // Deletions are applied before creations, allowing an account to be
    // re-created within the same block.
    if update.deleted {
        exists = false;
        reincarnation += 1;
        changed = true;
    }
    if update.created {
        exists = true;
        reincarnation += 1;
        changed = true;
    }
    (exists, reincarnation, changed)
}

/// Folds per-account hashes (in ascending address order) into the archive
/// root.
pub(crate) fn root_hash<I: IntoIterator<Item = Hash>>(account_hashes: I) -> Hash {
    let mut hash = ZERO_HASH;
    for account_hash in account_hashes {
        hash = chain_hash(&hash, &account_hash);
    }
    hash
}

/// All records of a single account up to some block, as collected by a
/// backend. Each list is sorted by block.
#[derive(Default)]
pub(crate) struct AccountHistory {
    pub status: Vec<(BlockId, bool, Reincarnation)>,
    pub balances: Vec<(BlockId, Balance)>,
    pub nonces: Vec<(BlockId, Nonce)>,
    pub codes: Vec<(BlockId, Hash, Vec<u8>)>,
    pub storage: Vec<(BlockId, Reincarnation, Key, Value)>,
    pub hashes: Vec<(BlockId, Hash)>,
}

fn corrupt(account: &Address, message: &str) -> CarmenError {
    CarmenError::Internal(format!("account {account}: {message}"))
}

/// Re-derives the account's update at every touched block, recomputes the
/// hash chain, and checks it against the stored per-block hashes. Also
/// enforces reincarnation coherence of storage records and Keccak coherence
/// of stored codes.
pub(crate) fn verify_account_history(
    account: &Address,
    history: &AccountHistory,
) -> Result<()> {
    let mut touched: BTreeSet<BlockId> = BTreeSet::new();
    touched.extend(history.status.iter().map(|r| r.0));
    touched.extend(history.balances.iter().map(|r| r.0));
    touched.extend(history.nonces.iter().map(|r| r.0));
    touched.extend(history.codes.iter().map(|r| r.0));
    touched.extend(history.storage.iter().map(|r| r.0));

    let hashed: BTreeSet<BlockId> = history.hashes.iter().map(|r| r.0).collect();
    if touched != hashed {
        return Err(corrupt(
            account,
            "hash records do not cover exactly the blocks with changes",
        ));
    }

    let mut exists = false;
    let mut reincarnation: Reincarnation = 0;
    let mut chain = ZERO_HASH;

    for &block in &touched {
        let mut update = AccountUpdate::default();

        if let Some(&(_, new_exists, new_reincarnation)) =
            history.status.iter().find(|r| r.0 == block)
        {
            match (new_reincarnation.wrapping_sub(reincarnation), new_exists) {
                (1, true) => update.created = true,
                (1, false) => update.deleted = true,
                (2, true) => {
                    update.created = true;
                    update.deleted = true;
                }
                _ => {
                    return Err(corrupt(account, "invalid status transition"));
                }
            }
            exists = new_exists;
            reincarnation = new_reincarnation;
        }

        update.balance = history
            .balances
            .iter()
            .find(|r| r.0 == block)
            .map(|r| r.1);
        update.nonce = history.nonces.iter().find(|r| r.0 == block).map(|r| r.1);

        if let Some((_, stored_hash, code)) = history.codes.iter().find(|r| r.0 == block) {
            if keccak256(code) != *stored_hash {
                return Err(corrupt(account, "code does not match its stored hash"));
            }
            update.code = Some(code.clone());
        }

        for (_, slot_reincarnation, key, value) in
            history.storage.iter().filter(|r| r.0 == block)
        {
            if *slot_reincarnation != reincarnation {
                return Err(corrupt(
                    account,
                    "storage record carries a stale reincarnation counter",
                ));
            }
            update.storage.push(SlotUpdate { key: *key, value: *value });
        }
        update.normalize()?;

        chain = chain_hash(&chain, &update.hash());
        let stored = history
            .hashes
            .iter()
            .find(|r| r.0 == block)
            .map(|r| r.1)
            .unwrap();
        if chain != stored {
            return Err(corrupt(account, "hash chain mismatch"));
        }
    }

    // `exists` tracked for completeness of the replay; the final value is
    // not an invariant by itself.
    let _ = exists;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_status_transitions() {
        let created = AccountUpdate { created: true, ..Default::default() };
        assert_eq!(apply_status(false, 0, &created), (true, 1, true));

        let deleted = AccountUpdate { deleted: true, ..Default::default() };
        assert_eq!(apply_status(true, 1, &deleted), (false, 2, true));

        let both = AccountUpdate { created: true, deleted: true, ..Default::default() };
        assert_eq!(apply_status(true, 1, &both), (true, 3, true));

        let neither = AccountUpdate::default();
        assert_eq!(apply_status(true, 2, &neither), (true, 2, false));
    }

    #[test]
    fn test_root_hash_is_order_sensitive_chain() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_eq!(root_hash([]), ZERO_HASH);
        assert_eq!(root_hash([a]), chain_hash(&ZERO_HASH, &a));
        assert_ne!(root_hash([a, b]), root_hash([b, a]));
    }

    #[test]
    fn test_verify_detects_missing_hash_record() {
        let account = Address::new([1; 20]);
        let history = AccountHistory {
            balances: vec![(1, Balance::from_u64(5))],
            ..Default::default()
        };
        assert!(verify_account_history(&account, &history).is_err());
    }

    #[test]
    fn test_verify_accepts_consistent_history() {
        let account = Address::new([1; 20]);
        let mut update = AccountUpdate {
            created: true,
            balance: Some(Balance::from_u64(5)),
            ..Default::default()
        };
        update.normalize().unwrap();
        let history = AccountHistory {
            status: vec![(1, true, 1)],
            balances: vec![(1, Balance::from_u64(5))],
            hashes: vec![(1, chain_hash(&ZERO_HASH, &update.hash()))],
            ..Default::default()
        };
        verify_account_history(&account, &history).unwrap();
    }

    #[test]
    fn test_verify_detects_stale_reincarnation() {
        let account = Address::new([1; 20]);
        let mut update = AccountUpdate {
            created: true,
            storage: vec![SlotUpdate {
                key: Key::new([2; 32]),
                value: Value::from_u64(3),
            }],
            ..Default::default()
        };
        update.normalize().unwrap();
        let history = AccountHistory {
            status: vec![(1, true, 1)],
            // Recorded with reincarnation 0 instead of the account's 1.
            storage: vec![(1, 0, Key::new([2; 32]), Value::from_u64(3))],
            hashes: vec![(1, chain_hash(&ZERO_HASH, &update.hash()))],
            ..Default::default()
        };
        assert!(verify_account_history(&account, &history).is_err());
    }
}
