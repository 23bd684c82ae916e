// Merkledb Cryptography Module
//
// This module provides the hashing primitives used by the trie:
// - SHA-256 over node encodings and large values
// - The 32-byte id type naming nodes and roots

pub mod hash;

// Re-export main components for easier access
pub use hash::{sha256, Id, ID_LEN};
