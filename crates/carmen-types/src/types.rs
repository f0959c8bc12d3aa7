use serde::{Deserialize, Serialize};

/// Block height within the chain.
pub type BlockId = u64;

/// Dense numeric ID assigned to an address by the address index.
pub type AddressId = u32;

/// Dense numeric ID assigned to a storage key by the key index.
pub type KeyId = u32;

/// Dense numeric ID assigned to a storage slot by the slot index.
pub type SlotId = u32;

/// Per-account counter bumped on create/delete, used to lazily invalidate
/// storage without iterating it.
pub type Reincarnation = u32;

/// A value type with a fixed serialized width, storable in page-packed stores.
///
/// The encoding is the one used for on-disk pages and therefore feeds into
/// page hashes; implementations must keep it stable.
pub trait FixedBytes: Copy + Default + Eq {
    /// The serialized width in bytes.
    const LEN: usize;

    /// Writes the value into `out`, which is exactly `LEN` bytes long.
    fn write_to(&self, out: &mut [u8]);

    /// Reads a value from `bytes`, which is exactly `LEN` bytes long.
    fn read_from(bytes: &[u8]) -> Self;
}

macro_rules! byte_array_type {
    ($(#[$doc:meta])* $name:ident, $len:expr) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn from_slice(slice: &[u8]) -> Self {
                let mut bytes = [0u8; $len];
                bytes.copy_from_slice(&slice[..$len]);
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn zero() -> Self {
                Self([0u8; $len])
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; $len]
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::zero()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl FixedBytes for $name {
            const LEN: usize = $len;

            fn write_to(&self, out: &mut [u8]) {
                out.copy_from_slice(&self.0);
            }

            fn read_from(bytes: &[u8]) -> Self {
                Self::from_slice(bytes)
            }
        }
    };
}

byte_array_type!(
    /// 20-byte account address
    Address,
    20
);

byte_array_type!(
    /// 32-byte storage slot key
    Key,
    32
);

byte_array_type!(
    /// 32-byte storage slot value; all-zero is the implicit default
    Value,
    32
);

byte_array_type!(
    /// 16-byte account balance, big-endian
    Balance,
    16
);

byte_array_type!(
    /// 8-byte account nonce, big-endian
    Nonce,
    8
);

impl Balance {
    /// Builds a balance from a small integer, big-endian.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[8..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }
}

impl Nonce {
    /// Builds a nonce from an integer, big-endian.
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }
}

impl Value {
    /// Builds a value whose low-order bytes hold the given integer,
    /// big-endian.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }
}

/// The existence state of an account. The default is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccountState {
    #[default]
    Unknown = 0,
    Exists = 1,
}

impl FixedBytes for AccountState {
    const LEN: usize = 1;

    fn write_to(&self, out: &mut [u8]) {
        out[0] = *self as u8;
    }

    fn read_from(bytes: &[u8]) -> Self {
        match bytes[0] {
            1 => AccountState::Exists,
            _ => AccountState::Unknown,
        }
    }
}

impl FixedBytes for u32 {
    const LEN: usize = 4;

    fn write_to(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        u32::from_le_bytes(bytes.try_into().unwrap())
    }
}

impl FixedBytes for carmen_crypto::Hash {
    const LEN: usize = 32;

    fn write_to(&self, out: &mut [u8]) {
        out.copy_from_slice(self);
    }

    fn read_from(bytes: &[u8]) -> Self {
        bytes.try_into().unwrap()
    }
}
