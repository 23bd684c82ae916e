use sha2::{Sha256, Digest};
use serde::{Serialize, Deserialize};
use std::fmt;

/// Length of an id in bytes
pub const ID_LEN: usize = 32;

/// Compute SHA-256 hash of data
pub fn sha256(data: &[u8]) -> [u8; ID_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// A 32-byte digest naming a trie node or a whole trie (its root)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Id([u8; ID_LEN]);

impl Id {
    /// The all-zero id, used as a placeholder for child entries that
    /// have not been hashed yet
    pub const EMPTY: Id = Id([0u8; ID_LEN]);

    /// Create a new id from bytes
    pub const fn new(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Create an id by hashing the provided data
    pub fn from_data(data: &[u8]) -> Self {
        Self(sha256(data))
    }

    /// Get the id as bytes
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Create an id from a slice, returning `None` unless it is exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; ID_LEN]>::try_from(bytes).ok().map(Self)
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; ID_LEN]> for Id {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", hex::encode(self.0))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
