use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use carmen_crypto::{chain_hash, keccak256, Hash, ZERO_HASH};
use carmen_types::error::{internal, CarmenError, Result};
use carmen_types::{
    AccountUpdate, Address, Balance, BlockId, Key, Nonce, Reincarnation, Update, Value,
};

use crate::verify::{apply_status, root_hash, verify_account_history, AccountHistory};
use crate::Archive;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS block (
    number INTEGER PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS status (
    account BLOB, block INTEGER, exist INTEGER, reincarnation INTEGER,
    PRIMARY KEY (account, block)
);
CREATE TABLE IF NOT EXISTS balance (
    account BLOB, block INTEGER, value BLOB,
    PRIMARY KEY (account, block)
);
CREATE TABLE IF NOT EXISTS nonce (
    account BLOB, block INTEGER, value BLOB,
    PRIMARY KEY (account, block)
);
CREATE TABLE IF NOT EXISTS code (
    account BLOB, block INTEGER, hash BLOB, code BLOB,
    PRIMARY KEY (account, block)
);
CREATE TABLE IF NOT EXISTS storage (
    account BLOB, reincarnation INTEGER, slot BLOB, block INTEGER, value BLOB,
    PRIMARY KEY (account, reincarnation, slot, block)
);
CREATE TABLE IF NOT EXISTS account_hash (
    account BLOB, block INTEGER, hash BLOB,
    PRIMARY KEY (account, block)
);
";

/// An archive over a SQLite database.
///
/// One table per record kind; point-in-time reads use
/// `block <= ? ORDER BY block DESC LIMIT 1`. The connection is shared behind
/// a mutex, which also serializes the monotonicity check with the write
/// transaction.
pub struct SqliteArchive {
    conn: Mutex<Connection>,
    closed: AtomicBool,
}

impl SqliteArchive {
    pub fn open(directory: &Path) -> Result<Self> {
        std::fs::create_dir_all(directory)?;
        let conn = Connection::open(directory.join("archive.sqlite")).map_err(internal)?;
        conn.execute_batch(SCHEMA).map_err(internal)?;
        Ok(Self {
            conn: Mutex::new(conn),
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

    fn latest_block(conn: &Connection) -> Result<Option<BlockId>> {
        let latest: Option<i64> = conn
            .query_row("SELECT MAX(number) FROM block", [], |row| row.get(0))
            .map_err(internal)?;
        Ok(latest.map(|block| block as BlockId))
    }

    fn status_at(
        conn: &Connection,
        block: BlockId,
        account: &Address,
    ) -> Result<(bool, Reincarnation)> {
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT exist, reincarnation FROM status
                 WHERE account = ?1 AND block <= ?2
                 ORDER BY block DESC LIMIT 1",
                params![account.as_bytes().as_slice(), block as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(internal)?;
        match row {
            Some((exists, reincarnation)) => Ok((exists != 0, reincarnation as Reincarnation)),
            None => Ok((false, 0)),
        }
    }

    fn account_hash_at(conn: &Connection, block: BlockId, account: &Address) -> Result<Hash> {
        let row: Option<Vec<u8>> = conn
            .query_row(
                "SELECT hash FROM account_hash
                 WHERE account = ?1 AND block <= ?2
                 ORDER BY block DESC LIMIT 1",
                params![account.as_bytes().as_slice(), block as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(internal)?;
        match row {
            Some(bytes) if bytes.len() == 32 => Ok(bytes.try_into().unwrap()),
            Some(_) => Err(CarmenError::Internal(
                "stored account hash has the wrong size".to_string(),
            )),
            None => Ok(ZERO_HASH),
        }
    }

    fn value_at(
        conn: &Connection,
        table: &str,
        block: BlockId,
        account: &Address,
    ) -> Result<Option<Vec<u8>>> {
        let query = format!(
            "SELECT value FROM {table}
             WHERE account = ?1 AND block <= ?2
             ORDER BY block DESC LIMIT 1"
        );
        conn.query_row(
            &query,
            params![account.as_bytes().as_slice(), block as i64],
            |row| row.get(0),
        )
        .optional()
        .map_err(internal)
    }

    fn account_list(conn: &Connection, block: BlockId) -> Result<Vec<Address>> {
        let mut statement = conn
            .prepare_cached(
                "SELECT DISTINCT account FROM account_hash
                 WHERE block <= ?1 ORDER BY account",
            )
            .map_err(internal)?;
        let rows = statement
            .query_map(params![block as i64], |row| row.get::<_, Vec<u8>>(0))
            .map_err(internal)?;
        let mut accounts = Vec::new();
        for row in rows {
            let bytes = row.map_err(internal)?;
            if bytes.len() != Address::LEN {
                return Err(CarmenError::Internal(
                    "stored account address has the wrong size".to_string(),
                ));
            }
            accounts.push(Address::from_slice(&bytes));
        }
        Ok(accounts)
    }

    fn collect_history(
        conn: &Connection,
        block: BlockId,
        account: &Address,
    ) -> Result<AccountHistory> {
        let mut history = AccountHistory::default();
        let account_bytes = account.as_bytes().as_slice();

        let mut statement = conn
            .prepare_cached(
                "SELECT block, exist, reincarnation FROM status
                 WHERE account = ?1 AND block <= ?2 ORDER BY block",
            )
            .map_err(internal)?;
        let rows = statement
            .query_map(params![account_bytes, block as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(internal)?;
        for row in rows {
            let (block, exists, reincarnation) = row.map_err(internal)?;
            history.status.push((
                block as BlockId,
                exists != 0,
                reincarnation as Reincarnation,
            ));
        }
        drop(statement);

        let mut statement = conn
            .prepare_cached(
                "SELECT block, value FROM balance
                 WHERE account = ?1 AND block <= ?2 ORDER BY block",
            )
            .map_err(internal)?;
        let rows = statement
            .query_map(params![account_bytes, block as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(internal)?;
        for row in rows {
            let (block, value) = row.map_err(internal)?;
            history.balances.push((block as BlockId, Balance::from_slice(&value)));
        }
        drop(statement);

        let mut statement = conn
            .prepare_cached(
                "SELECT block, value FROM nonce
                 WHERE account = ?1 AND block <= ?2 ORDER BY block",
            )
            .map_err(internal)?;
        let rows = statement
            .query_map(params![account_bytes, block as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(internal)?;
        for row in rows {
            let (block, value) = row.map_err(internal)?;
            history.nonces.push((block as BlockId, Nonce::from_slice(&value)));
        }
        drop(statement);

        let mut statement = conn
            .prepare_cached(
                "SELECT block, hash, code FROM code
                 WHERE account = ?1 AND block <= ?2 ORDER BY block",
            )
            .map_err(internal)?;
        let rows = statement
            .query_map(params![account_bytes, block as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })
            .map_err(internal)?;
        for row in rows {
            let (block, hash, code) = row.map_err(internal)?;
            if hash.len() != 32 {
                return Err(CarmenError::Internal(
                    "stored code hash has the wrong size".to_string(),
                ));
            }
            history.codes.push((block as BlockId, hash.try_into().unwrap(), code));
        }
        drop(statement);

        let mut statement = conn
            .prepare_cached(
                "SELECT block, reincarnation, slot, value FROM storage
                 WHERE account = ?1 AND block <= ?2 ORDER BY block",
            )
            .map_err(internal)?;
        let rows = statement
            .query_map(params![account_bytes, block as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })
            .map_err(internal)?;
        for row in rows {
            let (block, reincarnation, slot, value) = row.map_err(internal)?;
            history.storage.push((
                block as BlockId,
                reincarnation as Reincarnation,
                Key::from_slice(&slot),
                Value::from_slice(&value),
            ));
        }
        drop(statement);

        let mut statement = conn
            .prepare_cached(
                "SELECT block, hash FROM account_hash
                 WHERE account = ?1 AND block <= ?2 ORDER BY block",
            )
            .map_err(internal)?;
        let rows = statement
            .query_map(params![account_bytes, block as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(internal)?;
        for row in rows {
            let (block, hash) = row.map_err(internal)?;
            if hash.len() != 32 {
                return Err(CarmenError::Internal(
                    "stored account hash has the wrong size".to_string(),
                ));
            }
            history.hashes.push((block as BlockId, hash.try_into().unwrap()));
        }

        Ok(history)
    }
}

impl Archive for SqliteArchive {
    fn add(&self, block: BlockId, update: &Update) -> Result<()> {
        self.check_open()?;
        let mut conn = self.conn.lock();

        if let Some(latest) = Self::latest_block(&conn)? {
            if block <= latest {
                return Err(CarmenError::FailedPrecondition(format!(
                    "block {block} is not after the latest recorded block {latest}"
                )));
            }
        }

        let tx = conn.transaction().map_err(internal)?;
        for (address, account_update) in AccountUpdate::from_update(update).iter_mut() {
            account_update.normalize()?;
            let account_bytes = address.as_bytes().as_slice();

            let (exists, reincarnation) = Self::status_at(&tx, block, address)?;
            let (exists, reincarnation, changed) =
                apply_status(exists, reincarnation, account_update);
            if changed {
                tx.execute(
                    "INSERT INTO status (account, block, exist, reincarnation)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![account_bytes, block as i64, exists as i64, reincarnation as i64],
                )
                .map_err(internal)?;
            }

            if let Some(balance) = &account_update.balance {
                tx.execute(
                    "INSERT INTO balance (account, block, value) VALUES (?1, ?2, ?3)",
                    params![account_bytes, block as i64, balance.as_bytes().as_slice()],
                )
                .map_err(internal)?;
            }
            if let Some(nonce) = &account_update.nonce {
                tx.execute(
                    "INSERT INTO nonce (account, block, value) VALUES (?1, ?2, ?3)",
                    params![account_bytes, block as i64, nonce.as_bytes().as_slice()],
                )
                .map_err(internal)?;
            }
            if let Some(code) = &account_update.code {
                tx.execute(
                    "INSERT INTO code (account, block, hash, code) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        account_bytes,
                        block as i64,
                        keccak256(code).as_slice(),
                        code.as_slice()
                    ],
                )
                .map_err(internal)?;
            }
            for slot in &account_update.storage {
                tx.execute(
                    "INSERT INTO storage (account, reincarnation, slot, block, value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        account_bytes,
                        reincarnation as i64,
                        slot.key.as_bytes().as_slice(),
                        block as i64,
                        slot.value.as_bytes().as_slice()
                    ],
                )
                .map_err(internal)?;
            }

            let previous = Self::account_hash_at(&tx, block, address)?;
            let hash = chain_hash(&previous, &account_update.hash());
            tx.execute(
                "INSERT INTO account_hash (account, block, hash) VALUES (?1, ?2, ?3)",
                params![account_bytes, block as i64, hash.as_slice()],
            )
            .map_err(internal)?;
        }
        tx.execute(
            "INSERT INTO block (number) VALUES (?1)",
            params![block as i64],
        )
        .map_err(internal)?;
        debug!(block, "recording block update");
        tx.commit().map_err(internal)
    }

    fn exists(&self, block: BlockId, account: &Address) -> Result<bool> {
        self.check_open()?;
        let conn = self.conn.lock();
        Ok(Self::status_at(&conn, block, account)?.0)
    }

    fn get_balance(&self, block: BlockId, account: &Address) -> Result<Balance> {
        self.check_open()?;
        let conn = self.conn.lock();
        match Self::value_at(&conn, "balance", block, account)? {
            Some(value) if value.len() == Balance::LEN => Ok(Balance::from_slice(&value)),
            Some(_) => Err(CarmenError::Internal(
                "stored balance has the wrong size".to_string(),
            )),
            None => Ok(Balance::zero()),
        }
    }

    fn get_nonce(&self, block: BlockId, account: &Address) -> Result<Nonce> {
        self.check_open()?;
        let conn = self.conn.lock();
        match Self::value_at(&conn, "nonce", block, account)? {
            Some(value) if value.len() == Nonce::LEN => Ok(Nonce::from_slice(&value)),
            Some(_) => Err(CarmenError::Internal(
                "stored nonce has the wrong size".to_string(),
            )),
            None => Ok(Nonce::zero()),
        }
    }

    fn get_code(&self, block: BlockId, account: &Address) -> Result<Vec<u8>> {
        self.check_open()?;
        let conn = self.conn.lock();
        let row: Option<Vec<u8>> = conn
            .query_row(
                "SELECT code FROM code
                 WHERE account = ?1 AND block <= ?2
                 ORDER BY block DESC LIMIT 1",
                params![account.as_bytes().as_slice(), block as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(internal)?;
        Ok(row.unwrap_or_default())
    }

    fn get_storage(&self, block: BlockId, account: &Address, key: &Key) -> Result<Value> {
        self.check_open()?;
        let conn = self.conn.lock();
        let (_, reincarnation) = Self::status_at(&conn, block, account)?;
        let row: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM storage
                 WHERE account = ?1 AND reincarnation = ?2 AND slot = ?3 AND block <= ?4
                 ORDER BY block DESC LIMIT 1",
                params![
                    account.as_bytes().as_slice(),
                    reincarnation as i64,
                    key.as_bytes().as_slice(),
                    block as i64
                ],
                |row| row.get(0),
            )
            .optional()
            .map_err(internal)?;
        match row {
            Some(value) if value.len() == Value::LEN => Ok(Value::from_slice(&value)),
            Some(_) => Err(CarmenError::Internal(
                "stored slot value has the wrong size".to_string(),
            )),
            None => Ok(Value::zero()),
        }
    }

    fn get_latest_block(&self) -> Result<BlockId> {
        self.check_open()?;
        let conn = self.conn.lock();
        Ok(Self::latest_block(&conn)?.unwrap_or(0))
    }

    fn get_hash(&self, block: BlockId) -> Result<Hash> {
        self.check_open()?;
        let conn = self.conn.lock();
        let mut hashes = Vec::new();
        for account in Self::account_list(&conn, block)? {
            hashes.push(Self::account_hash_at(&conn, block, &account)?);
        }
        Ok(root_hash(hashes))
    }

    fn get_account_list(&self, block: BlockId) -> Result<Vec<Address>> {
        self.check_open()?;
        let conn = self.conn.lock();
        Self::account_list(&conn, block)
    }

    fn get_account_hash(&self, block: BlockId, account: &Address) -> Result<Hash> {
        self.check_open()?;
        let conn = self.conn.lock();
        Self::account_hash_at(&conn, block, account)
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
        let conn = self.conn.lock();
        let history = Self::collect_history(&conn, block, account)?;
        verify_account_history(account, &history)
    }

    fn flush(&self) -> Result<()> {
        self.check_open()
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvArchive;
    use tempfile::TempDir;

    fn address(seed: u8) -> Address {
        Address::new([seed; 20])
    }

    fn key(seed: u8) -> Key {
        Key::new([seed; 32])
    }

    fn open() -> (TempDir, SqliteArchive) {
        let dir = TempDir::new().unwrap();
        let archive = SqliteArchive::open(dir.path()).unwrap();
        (dir, archive)
    }

    #[test]
    fn test_empty_archive() {
        let (_dir, archive) = open();
        assert_eq!(archive.get_latest_block().unwrap(), 0);
        assert!(!archive.exists(5, &address(1)).unwrap());
        assert_eq!(archive.get_hash(5).unwrap(), ZERO_HASH);
    }

    #[test]
    fn test_block_monotonicity() {
        let (_dir, archive) = open();
        archive.add(0, &Update::new()).unwrap();
        archive.add(3, &Update::new()).unwrap();
        assert!(matches!(
            archive.add(3, &Update::new()),
            Err(CarmenError::FailedPrecondition(_))
        ));
        assert_eq!(archive.get_latest_block().unwrap(), 3);
    }

    #[test]
    fn test_point_in_time_reads() {
        let (_dir, archive) = open();
        let account = address(1);
        let slot = key(2);

        let mut first = Update::new();
        first.create(account);
        first.set_balance(account, Balance::from_u64(0xB1));
        first.set_storage(account, slot, Value::from_u64(0x01));
        archive.add(1, &first).unwrap();

        let mut second = Update::new();
        second.delete(account);
        second.set_balance(account, Balance::from_u64(0xB2));
        second.set_storage(account, slot, Value::from_u64(0x02));
        archive.add(3, &second).unwrap();

        let expected_exists = [false, true, true, false, false];
        let expected_balance = [0u64, 0xB1, 0xB1, 0xB2, 0xB2];
        let expected_storage = [0u64, 0x01, 0x01, 0x02, 0x02];
        for block in 0..5u64 {
            assert_eq!(
                archive.exists(block, &account).unwrap(),
                expected_exists[block as usize]
            );
            assert_eq!(
                archive.get_balance(block, &account).unwrap(),
                Balance::from_u64(expected_balance[block as usize])
            );
            assert_eq!(
                archive.get_storage(block, &account, &slot).unwrap(),
                Value::from_u64(expected_storage[block as usize])
            );
        }
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

        let root = archive.get_hash(1).unwrap();
        archive.verify(1, &root, &mut |_| {}).unwrap();
        assert!(archive.verify(1, &ZERO_HASH, &mut |_| {}).is_err());
    }

    #[test]
    fn test_hash_agreement_with_kv_archive() {
        let kv_dir = TempDir::new().unwrap();
        let sqlite_dir = TempDir::new().unwrap();
        let kv = KvArchive::open(kv_dir.path()).unwrap();
        let sqlite = SqliteArchive::open(sqlite_dir.path()).unwrap();

        let mut first = Update::new();
        first.create(address(1));
        first.set_balance(address(1), Balance::from_u64(10));
        first.set_code(address(1), vec![0xAA]);
        first.set_storage(address(1), key(7), Value::from_u64(3));
        first.set_nonce(address(2), Nonce::from_u64(1));

        let mut second = Update::new();
        second.delete(address(1));
        second.create(address(1));
        second.set_balance(address(3), Balance::from_u64(8));

        for archive in [&kv as &dyn Archive, &sqlite as &dyn Archive] {
            archive.add(1, &first).unwrap();
            archive.add(2, &second).unwrap();
        }

        for block in 0..3u64 {
            assert_eq!(
                kv.get_hash(block).unwrap(),
                sqlite.get_hash(block).unwrap(),
                "hash agreement at block {block}"
            );
        }
        assert_eq!(
            kv.get_account_list(2).unwrap(),
            sqlite.get_account_list(2).unwrap()
        );
        assert_eq!(
            kv.get_account_hash(2, &address(1)).unwrap(),
            sqlite.get_account_hash(2, &address(1)).unwrap()
        );
    }
}
