use carmen_archive::Archive;
use carmen_crypto::{keccak256, Hash};
use carmen_types::error::Result;
use carmen_types::{AccountState, Address, Balance, BlockId, Key, Nonce, Value};

use crate::live::empty_code_hash;

/// A read-only view of the state as of a fixed block, answered from the
/// archive.
///
/// The view borrows the archive (typically the one owned by a live state)
/// and exposes the getter surface of a state; every query resolves to the
/// most recent record at or before the bound block.
pub struct HistoricView<'a> {
    archive: &'a dyn Archive,
    block: BlockId,
}

impl<'a> HistoricView<'a> {
    pub fn new(archive: &'a dyn Archive, block: BlockId) -> Self {
        Self { archive, block }
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn get_account_state(&self, address: &Address) -> Result<AccountState> {
        if self.archive.exists(self.block, address)? {
            Ok(AccountState::Exists)
        } else {
            Ok(AccountState::Unknown)
        }
    }

    pub fn get_balance(&self, address: &Address) -> Result<Balance> {
        self.archive.get_balance(self.block, address)
    }

    pub fn get_nonce(&self, address: &Address) -> Result<Nonce> {
        self.archive.get_nonce(self.block, address)
    }

    pub fn get_storage_value(&self, address: &Address, key: &Key) -> Result<Value> {
        self.archive.get_storage(self.block, address, key)
    }

    pub fn get_code(&self, address: &Address) -> Result<Vec<u8>> {
        self.archive.get_code(self.block, address)
    }

    pub fn get_code_size(&self, address: &Address) -> Result<u32> {
        Ok(self.archive.get_code(self.block, address)?.len() as u32)
    }

    pub fn get_code_hash(&self, address: &Address) -> Result<Hash> {
        let code = self.archive.get_code(self.block, address)?;
        if code.is_empty() {
            Ok(empty_code_hash())
        } else {
            Ok(keccak256(&code))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carmen_archive::KvArchive;
    use carmen_types::Update;
    use tempfile::TempDir;

    #[test]
    fn test_views_are_bound_to_their_block() {
        let dir = TempDir::new().unwrap();
        let archive = KvArchive::open(dir.path()).unwrap();
        let account = Address::new([1; 20]);

        let mut first = Update::new();
        first.create(account);
        first.set_balance(account, Balance::from_u64(10));
        first.set_code(account, vec![0xAB]);
        archive.add(1, &first).unwrap();

        let mut second = Update::new();
        second.set_balance(account, Balance::from_u64(20));
        archive.add(2, &second).unwrap();

        let early = HistoricView::new(&archive, 1);
        let late = HistoricView::new(&archive, 2);
        assert_eq!(early.get_balance(&account).unwrap(), Balance::from_u64(10));
        assert_eq!(late.get_balance(&account).unwrap(), Balance::from_u64(20));
        assert_eq!(early.get_account_state(&account).unwrap(), AccountState::Exists);
        assert_eq!(early.get_code_hash(&account).unwrap(), keccak256(&[0xAB]));
        assert_eq!(early.get_code_size(&account).unwrap(), 1);

        let genesis = HistoricView::new(&archive, 0);
        assert_eq!(genesis.get_balance(&account).unwrap(), Balance::zero());
        assert_eq!(genesis.get_code_hash(&account).unwrap(), empty_code_hash());
    }
}
