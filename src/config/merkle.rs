use serde::{Serialize, Deserialize};

use crate::storage::trie::key::BranchFactor;

/// Trie configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MerkleConfig {
    /// Children per node: 2, 4, 16 or 256
    pub branch_factor: BranchFactor,

    /// Number of committed roots kept for change proofs and proofs at
    /// older roots
    pub history_length: usize,
}

impl Default for MerkleConfig {
    fn default() -> Self {
        Self {
            branch_factor: BranchFactor::Sixteen,
            history_length: 300,
        }
    }
}
