// Carmen domain types
// Primitive value types of the state model, the block update wire codec, and
// the error kinds surfaced at the engine boundary.

pub mod error;
pub mod types;
pub mod update;

pub use error::{CarmenError, Result};
pub use types::{
    AccountState, Address, AddressId, Balance, BlockId, FixedBytes, Key, KeyId, Nonce,
    Reincarnation, SlotId, Value,
};
pub use update::{AccountUpdate, SlotUpdate, Update};

pub use carmen_crypto::Hash;
