//! Merkle radix trie with bit-packed keys and verifiable proofs

pub mod codec;
pub mod history;
pub mod key;
pub mod metrics;
pub mod mpt;
pub mod node;
pub mod proof;
pub mod proof_iterator;

pub use codec::CodecError;
pub use history::{ChangeSummary, TrieHistory, ValueChange};
pub use key::{BranchFactor, InvalidBranchFactor, Key, Token};
pub use metrics::{NoopMetrics, TrieCounters, TrieMetrics, TrieStats};
pub use mpt::{MerkleTrie, TrieError, TrieResult};
pub use node::Node;
pub use proof::{ChangeProof, KeyChange, KeyValue, Proof, ProofError, ProofNode, ProofResult, RangeProof};
pub use proof_iterator::ProofIterator;
