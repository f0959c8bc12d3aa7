use sha2::{Digest, Sha256};
use sha3::Keccak256;

/// 32-byte hash type
pub type Hash = [u8; 32];

/// The all-zero hash, used as the default fingerprint of empty structures.
pub const ZERO_HASH: Hash = [0u8; 32];

/// SHA256 hash function
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Keccak256 hash function
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// One step of an insertion-order chain hash: `h' = SHA256(h || data)`.
///
/// Indexes fingerprint their key sequence by folding every newly assigned key
/// into the running hash with this function, starting from [ZERO_HASH].
pub fn chain_hash(prev: &Hash, data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(prev);
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Incremental SHA-256 hasher for composing hashes over multiple fields.
pub struct Sha256Hasher {
    inner: Sha256,
}

impl Sha256Hasher {
    pub fn new() -> Self {
        Self { inner: Sha256::new() }
    }

    /// Adds the given bytes to the sequence being hashed.
    pub fn ingest(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalizes the hash and consumes the hasher.
    pub fn finish(self) -> Hash {
        let result = self.inner.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    }
}

impl Default for Sha256Hasher {
    fn default() -> Self {
        Self::new()
    }
}
