// merkledb - authenticated key/value store on a merkle radix trie, with
// inclusion, range and change proofs for state sync between peers

pub mod config;
pub mod crypto;
pub mod storage;

pub use crypto::hash::Id;
pub use storage::merkle_db::{MerkleDb, MerkleDbError, MerkleDbResult};
pub use storage::trie::{BranchFactor, ChangeProof, Key, Proof, ProofError, RangeProof};

// Initialize logging
pub fn init_logger() {
    env_logger::init();
}
