// Carmen cryptography module
// SHA-256 for structural hashing, Keccak-256 for contract code hashing.

pub mod hash;

pub use hash::{chain_hash, keccak256, sha256, Hash, Sha256Hasher, ZERO_HASH};
