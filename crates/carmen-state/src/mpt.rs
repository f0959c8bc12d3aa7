//! Experimental in-memory Merkle Patricia trie state (schema 4).
//!
//! One trie stores all accounts, keyed by address nibbles; each account owns
//! a storage trie in a shared forest, keyed by slot-key nibbles. Nodes are
//! arena-allocated and addressed by 32-bit tagged ids; node hashes are
//! cached per node and recomputed lazily on demand.

use std::collections::{HashMap, HashSet};

use carmen_archive::Archive;
use carmen_crypto::{keccak256, Hash, Sha256Hasher, ZERO_HASH};
use carmen_types::error::Result;
use carmen_types::{AccountState, Address, Balance, BlockId, Key, Nonce, Update, Value};

use crate::live::{empty_code_hash, State};

/// A tagged node reference. 0 is the empty node; a leading 0 bit marks a
/// leaf (storing index + 1), prefix 10 a branch, prefix 11 an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeId(u32);

impl NodeId {
    pub const EMPTY: NodeId = NodeId(0);

    fn leaf(index: u32) -> Self {
        NodeId(index + 1)
    }

    fn branch(index: u32) -> Self {
        NodeId(0x8000_0000 | index)
    }

    fn extension(index: u32) -> Self {
        NodeId(0xC000_0000 | index)
    }

    fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn is_leaf(self) -> bool {
        !self.is_empty() && self.0 >> 31 == 0
    }

    fn is_branch(self) -> bool {
        self.0 >> 30 == 2
    }

    fn is_extension(self) -> bool {
        self.0 >> 30 == 3
    }

    fn index(self) -> usize {
        if self.is_leaf() {
            ((self.0 & 0x7FFF_FFFF) - 1) as usize
        } else {
            (self.0 & 0x3FFF_FFFF) as usize
        }
    }
}

/// A value storable in trie leaves; its image feeds into the leaf hash. The
/// default value is not stored: writing it removes the leaf.
pub trait TrieValue: Clone + Default + PartialEq {
    fn ingest(&self, hasher: &mut Sha256Hasher);
}

impl TrieValue for Value {
    fn ingest(&self, hasher: &mut Sha256Hasher) {
        hasher.ingest(self.as_bytes());
    }
}

#[derive(Clone)]
struct BranchNode {
    children: [NodeId; 16],
}

#[derive(Clone)]
struct ExtensionNode {
    path: Vec<u8>,
    next: NodeId,
}

#[derive(Clone)]
struct LeafNode<V> {
    path: Vec<u8>,
    value: V,
}

/// Node storage with index reuse and a lazily maintained hash per node.
struct Arena<T> {
    nodes: Vec<T>,
    hashes: Vec<Option<Hash>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self { nodes: Vec::new(), hashes: Vec::new(), free: Vec::new() }
    }

    fn alloc(&mut self, node: T) -> u32 {
        if let Some(index) = self.free.pop() {
            self.nodes[index as usize] = node;
            self.hashes[index as usize] = None;
            index
        } else {
            self.nodes.push(node);
            self.hashes.push(None);
            (self.nodes.len() - 1) as u32
        }
    }

    fn release(&mut self, index: usize) {
        self.free.push(index as u32);
    }

    fn invalidate(&mut self, index: usize) {
        self.hashes[index] = None;
    }
}

/// Splits a key into 4-bit nibbles, high nibble first.
fn nibbles(bytes: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(bytes.len() * 2);
    for byte in bytes {
        result.push(byte >> 4);
        result.push(byte & 0xF);
    }
    result
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// A forest of Merkle Patricia tries sharing one node arena.
///
/// Roots are owned by the callers and passed into every operation; all keys
/// of one forest must have the same nibble length. Removals collapse
/// single-child branches, so the node structure (and thus the root hash) is
/// a function of the stored content alone.
pub struct MptForest<V: TrieValue> {
    branches: Arena<BranchNode>,
    extensions: Arena<ExtensionNode>,
    leaves: Arena<LeafNode<V>>,
}

impl<V: TrieValue> MptForest<V> {
    pub fn new() -> Self {
        Self {
            branches: Arena::new(),
            extensions: Arena::new(),
            leaves: Arena::new(),
        }
    }

    /// Looks up the value under the key; absent keys read as the default.
    pub fn get(&self, root: NodeId, key: &[u8]) -> V {
        let path = nibbles(key);
        let mut node = root;
        let mut offset = 0;
        loop {
            if node.is_empty() {
                return V::default();
            }
            if node.is_leaf() {
                let leaf = &self.leaves.nodes[node.index()];
                if leaf.path == path[offset..] {
                    return leaf.value.clone();
                }
                return V::default();
            }
            if node.is_extension() {
                let extension = &self.extensions.nodes[node.index()];
                if !path[offset..].starts_with(&extension.path) {
                    return V::default();
                }
                offset += extension.path.len();
                node = extension.next;
            } else {
                let branch = &self.branches.nodes[node.index()];
                node = branch.children[path[offset] as usize];
                offset += 1;
            }
        }
    }

    /// Stores the value under the key; the default value removes the entry.
    /// Returns whether the trie changed.
    pub fn set(&mut self, root: &mut NodeId, key: &[u8], value: V) -> bool {
        let path = nibbles(key);
        if value == V::default() {
            let (new_root, changed) = self.delete(*root, &path);
            *root = new_root;
            return changed;
        }
        let (new_root, changed) = self.insert(*root, &path, value);
        *root = new_root;
        changed
    }

    /// Releases all nodes of the tree and resets the root.
    pub fn remove_tree(&mut self, root: &mut NodeId) {
        self.release_recursive(*root);
        *root = NodeId::EMPTY;
    }

    /// Computes (and caches) the hash of the given subtree.
    pub fn hash_of(&mut self, node: NodeId) -> Hash {
        if node.is_empty() {
            return ZERO_HASH;
        }
        let index = node.index();
        if node.is_leaf() {
            if let Some(hash) = self.leaves.hashes[index] {
                return hash;
            }
            let mut hasher = Sha256Hasher::new();
            hasher.ingest(&[0x00]);
            hasher.ingest(&(self.leaves.nodes[index].path.len() as u16).to_be_bytes());
            hasher.ingest(&self.leaves.nodes[index].path.clone());
            let value = self.leaves.nodes[index].value.clone();
            value.ingest(&mut hasher);
            let hash = hasher.finish();
            self.leaves.hashes[index] = Some(hash);
            return hash;
        }
        if node.is_extension() {
            if let Some(hash) = self.extensions.hashes[index] {
                return hash;
            }
            let path = self.extensions.nodes[index].path.clone();
            let next = self.extensions.nodes[index].next;
            let next_hash = self.hash_of(next);
            let mut hasher = Sha256Hasher::new();
            hasher.ingest(&[0x01]);
            hasher.ingest(&(path.len() as u16).to_be_bytes());
            hasher.ingest(&path);
            hasher.ingest(&next_hash);
            let hash = hasher.finish();
            self.extensions.hashes[index] = Some(hash);
            return hash;
        }
        if let Some(hash) = self.branches.hashes[index] {
            return hash;
        }
        let children = self.branches.nodes[index].children;
        let mut child_hashes = [ZERO_HASH; 16];
        for (slot, child) in children.iter().enumerate() {
            child_hashes[slot] = self.hash_of(*child);
        }
        let mut hasher = Sha256Hasher::new();
        hasher.ingest(&[0x02]);
        for child_hash in &child_hashes {
            hasher.ingest(child_hash);
        }
        let hash = hasher.finish();
        self.branches.hashes[index] = Some(hash);
        hash
    }

    fn insert(&mut self, node: NodeId, path: &[u8], value: V) -> (NodeId, bool) {
        if node.is_empty() {
            let index = self.leaves.alloc(LeafNode { path: path.to_vec(), value });
            return (NodeId::leaf(index), true);
        }

        if node.is_leaf() {
            let index = node.index();
            if self.leaves.nodes[index].path == path {
                if self.leaves.nodes[index].value == value {
                    return (node, false);
                }
                self.leaves.nodes[index].value = value;
                self.leaves.invalidate(index);
                return (node, true);
            }
            // Diverging keys: split the leaf below a new branch.
            let existing_path = self.leaves.nodes[index].path.clone();
            let common = common_prefix_len(&existing_path, path);
            let existing_nibble = existing_path[common];
            let new_nibble = path[common];
            self.leaves.nodes[index].path = existing_path[common + 1..].to_vec();
            self.leaves.invalidate(index);
            let new_leaf = NodeId::leaf(
                self.leaves
                    .alloc(LeafNode { path: path[common + 1..].to_vec(), value }),
            );
            let mut branch = BranchNode { children: [NodeId::EMPTY; 16] };
            branch.children[existing_nibble as usize] = node;
            branch.children[new_nibble as usize] = new_leaf;
            let branch_id = NodeId::branch(self.branches.alloc(branch));
            return (self.wrap_in_extension(&path[..common], branch_id), true);
        }

        if node.is_branch() {
            let index = node.index();
            let nibble = path[0] as usize;
            let child = self.branches.nodes[index].children[nibble];
            let (new_child, changed) = self.insert(child, &path[1..], value);
            if changed {
                self.branches.nodes[index].children[nibble] = new_child;
                self.branches.invalidate(index);
            }
            return (node, changed);
        }

        // Extension node.
        let index = node.index();
        let extension_path = self.extensions.nodes[index].path.clone();
        let common = common_prefix_len(&extension_path, path);
        if common == extension_path.len() {
            let next = self.extensions.nodes[index].next;
            let (new_next, changed) = self.insert(next, &path[common..], value);
            if changed {
                self.extensions.nodes[index].next = new_next;
                self.extensions.invalidate(index);
            }
            return (node, changed);
        }

        // Diverging inside the extension: split it at the common prefix.
        let extension_nibble = extension_path[common];
        let new_nibble = path[common];
        let next = self.extensions.nodes[index].next;
        let old_tail = if common + 1 == extension_path.len() {
            self.extensions.release(index);
            next
        } else {
            self.extensions.nodes[index].path = extension_path[common + 1..].to_vec();
            self.extensions.invalidate(index);
            node
        };
        let new_leaf = NodeId::leaf(
            self.leaves
                .alloc(LeafNode { path: path[common + 1..].to_vec(), value }),
        );
        let mut branch = BranchNode { children: [NodeId::EMPTY; 16] };
        branch.children[extension_nibble as usize] = old_tail;
        branch.children[new_nibble as usize] = new_leaf;
        let branch_id = NodeId::branch(self.branches.alloc(branch));
        (self.wrap_in_extension(&path[..common], branch_id), true)
    }

    fn wrap_in_extension(&mut self, prefix: &[u8], node: NodeId) -> NodeId {
        if prefix.is_empty() {
            return node;
        }
        NodeId::extension(
            self.extensions
                .alloc(ExtensionNode { path: prefix.to_vec(), next: node }),
        )
    }

    fn delete(&mut self, node: NodeId, path: &[u8]) -> (NodeId, bool) {
        if node.is_empty() {
            return (node, false);
        }

        if node.is_leaf() {
            let index = node.index();
            if self.leaves.nodes[index].path == path {
                self.leaves.release(index);
                return (NodeId::EMPTY, true);
            }
            return (node, false);
        }

        if node.is_extension() {
            let index = node.index();
            let extension_path = self.extensions.nodes[index].path.clone();
            if !path.starts_with(&extension_path) {
                return (node, false);
            }
            let next = self.extensions.nodes[index].next;
            let (new_next, changed) = self.delete(next, &path[extension_path.len()..]);
            if !changed {
                return (node, false);
            }
            if new_next.is_empty() {
                self.extensions.release(index);
                return (NodeId::EMPTY, true);
            }
            if new_next.is_leaf() {
                // Merge the extension's path into the surviving leaf.
                let leaf_index = new_next.index();
                let mut merged = extension_path;
                merged.extend_from_slice(&self.leaves.nodes[leaf_index].path);
                self.leaves.nodes[leaf_index].path = merged;
                self.leaves.invalidate(leaf_index);
                self.extensions.release(index);
                return (new_next, true);
            }
            if new_next.is_extension() {
                // Merge adjacent extensions.
                let next_index = new_next.index();
                let mut merged = extension_path;
                merged.extend_from_slice(&self.extensions.nodes[next_index].path);
                self.extensions.nodes[next_index].path = merged;
                self.extensions.invalidate(next_index);
                self.extensions.release(index);
                return (new_next, true);
            }
            self.extensions.nodes[index].next = new_next;
            self.extensions.invalidate(index);
            return (node, true);
        }

        // Branch node.
        let index = node.index();
        let nibble = path[0] as usize;
        let child = self.branches.nodes[index].children[nibble];
        let (new_child, changed) = self.delete(child, &path[1..]);
        if !changed {
            return (node, false);
        }
        self.branches.nodes[index].children[nibble] = new_child;
        self.branches.invalidate(index);

        let remaining: Vec<(usize, NodeId)> = self.branches.nodes[index]
            .children
            .iter()
            .enumerate()
            .filter(|(_, child)| !child.is_empty())
            .map(|(slot, child)| (slot, *child))
            .collect();
        if remaining.len() >= 2 {
            return (node, true);
        }

        // A single child remains: collapse the branch into it.
        let (last_nibble, last_child) = remaining[0];
        self.branches.release(index);
        if last_child.is_leaf() {
            let leaf_index = last_child.index();
            let mut merged = vec![last_nibble as u8];
            merged.extend_from_slice(&self.leaves.nodes[leaf_index].path);
            self.leaves.nodes[leaf_index].path = merged;
            self.leaves.invalidate(leaf_index);
            return (last_child, true);
        }
        if last_child.is_extension() {
            let extension_index = last_child.index();
            let mut merged = vec![last_nibble as u8];
            merged.extend_from_slice(&self.extensions.nodes[extension_index].path);
            self.extensions.nodes[extension_index].path = merged;
            self.extensions.invalidate(extension_index);
            return (last_child, true);
        }
        let collapsed = NodeId::extension(self.extensions.alloc(ExtensionNode {
            path: vec![last_nibble as u8],
            next: last_child,
        }));
        (collapsed, true)
    }

    fn release_recursive(&mut self, node: NodeId) {
        if node.is_empty() {
            return;
        }
        let index = node.index();
        if node.is_leaf() {
            self.leaves.release(index);
        } else if node.is_extension() {
            let next = self.extensions.nodes[index].next;
            self.release_recursive(next);
            self.extensions.release(index);
        } else {
            let children = self.branches.nodes[index].children;
            for child in children {
                self.release_recursive(child);
            }
            self.branches.release(index);
        }
    }
}

impl<V: TrieValue> Default for MptForest<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// The information stored per account in the account trie.
#[derive(Debug, Clone, Default, PartialEq)]
struct AccountInfo {
    exists: bool,
    nonce: Nonce,
    balance: Balance,
    code_hash: Hash,
    storage: NodeId,
    storage_hash: Hash,
}

impl TrieValue for AccountInfo {
    fn ingest(&self, hasher: &mut Sha256Hasher) {
        hasher.ingest(&[self.exists as u8]);
        hasher.ingest(self.nonce.as_bytes());
        hasher.ingest(self.balance.as_bytes());
        hasher.ingest(&self.code_hash);
        // The storage root id is an arena detail; only its hash is part of
        // the account image.
        hasher.ingest(&self.storage_hash);
    }
}

/// An in-memory state backed by a Merkle Patricia trie forest.
///
/// Codes are deduplicated by their Keccak hash. Nothing is persisted;
/// `flush` and `close` are no-ops and no archive can be attached.
pub struct MptState {
    accounts: MptForest<AccountInfo>,
    accounts_root: NodeId,
    values: MptForest<Value>,
    codes: HashMap<Hash, Vec<u8>>,
    dirty_accounts: HashSet<Address>,
}

impl MptState {
    pub fn new() -> Self {
        Self {
            accounts: MptForest::new(),
            accounts_root: NodeId::EMPTY,
            values: MptForest::new(),
            codes: HashMap::new(),
            dirty_accounts: HashSet::new(),
        }
    }

    fn get_account(&self, address: &Address) -> AccountInfo {
        self.accounts.get(self.accounts_root, address.as_bytes())
    }

    fn set_account(&mut self, address: &Address, account: AccountInfo) -> bool {
        self.accounts
            .set(&mut self.accounts_root, address.as_bytes(), account)
    }
}

impl Default for MptState {
    fn default() -> Self {
        Self::new()
    }
}

impl State for MptState {
    fn create_account(&mut self, address: &Address) -> Result<()> {
        // Creating an account resets it, which is the same as deleting it.
        self.delete_account(address)?;
        let account = AccountInfo { exists: true, ..Default::default() };
        if self.set_account(address, account) {
            self.dirty_accounts.insert(*address);
        }
        Ok(())
    }

    fn get_account_state(&mut self, address: &Address) -> Result<AccountState> {
        if self.get_account(address) == AccountInfo::default() {
            Ok(AccountState::Unknown)
        } else {
            Ok(AccountState::Exists)
        }
    }

    fn delete_account(&mut self, address: &Address) -> Result<()> {
        let mut account = self.get_account(address);
        if account == AccountInfo::default() {
            return Ok(());
        }
        self.values.remove_tree(&mut account.storage);
        self.set_account(address, AccountInfo::default());
        self.dirty_accounts.remove(address);
        Ok(())
    }

    fn get_balance(&mut self, address: &Address) -> Result<Balance> {
        Ok(self.get_account(address).balance)
    }

    fn set_balance(&mut self, address: &Address, balance: Balance) -> Result<()> {
        let mut account = self.get_account(address);
        account.balance = balance;
        if self.set_account(address, account) {
            self.dirty_accounts.insert(*address);
        }
        Ok(())
    }

    fn get_nonce(&mut self, address: &Address) -> Result<Nonce> {
        Ok(self.get_account(address).nonce)
    }

    fn set_nonce(&mut self, address: &Address, nonce: Nonce) -> Result<()> {
        let mut account = self.get_account(address);
        account.nonce = nonce;
        if self.set_account(address, account) {
            self.dirty_accounts.insert(*address);
        }
        Ok(())
    }

    fn get_storage_value(&mut self, address: &Address, key: &Key) -> Result<Value> {
        let account = self.get_account(address);
        Ok(self.values.get(account.storage, key.as_bytes()))
    }

    fn set_storage_value(&mut self, address: &Address, key: &Key, value: Value) -> Result<()> {
        let mut account = self.get_account(address);
        let mut root = account.storage;
        if self.values.set(&mut root, key.as_bytes(), value) {
            self.dirty_accounts.insert(*address);
        }
        if root != account.storage {
            account.storage = root;
            self.set_account(address, account);
        }
        Ok(())
    }

    fn get_code(&mut self, address: &Address) -> Result<Vec<u8>> {
        let account = self.get_account(address);
        if !account.exists {
            return Ok(Vec::new());
        }
        Ok(self.codes.get(&account.code_hash).cloned().unwrap_or_default())
    }

    fn set_code(&mut self, address: &Address, code: &[u8]) -> Result<()> {
        let code_hash = keccak256(code);
        let mut account = self.get_account(address);
        if account.code_hash == code_hash {
            return Ok(());
        }
        self.codes.insert(code_hash, code.to_vec());
        account.exists = true;
        account.code_hash = code_hash;
        if self.set_account(address, account) {
            self.dirty_accounts.insert(*address);
        }
        Ok(())
    }

    fn get_code_size(&mut self, address: &Address) -> Result<u32> {
        Ok(self.get_code(address)?.len() as u32)
    }

    fn get_code_hash(&mut self, address: &Address) -> Result<Hash> {
        let account = self.get_account(address);
        if account.exists && account.code_hash != ZERO_HASH {
            Ok(account.code_hash)
        } else {
            Ok(empty_code_hash())
        }
    }

    fn apply(&mut self, _block: BlockId, update: &Update) -> Result<()> {
        self.apply_to_state(update)
    }

    fn archive(&self) -> Option<&dyn Archive> {
        None
    }

    fn get_hash(&mut self) -> Result<Hash> {
        // Refresh the storage hash of every account with pending changes.
        let dirty: Vec<Address> = self.dirty_accounts.drain().collect();
        for address in dirty {
            let mut account = self.get_account(&address);
            if account == AccountInfo::default() {
                continue;
            }
            account.storage_hash = self.values.hash_of(account.storage);
            self.set_account(&address, account);
        }
        Ok(self.accounts.hash_of(self.accounts_root))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
