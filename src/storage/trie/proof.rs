//! Merkle proofs
//!
//! A [`Proof`] proves the value (or absence) of one key under a root id. A
//! [`RangeProof`] proves the complete contents of a key range, and a
//! [`ChangeProof`] proves the changes made to a key range between two roots.
//!
//! Proofs are detached snapshots: they carry everything needed for
//! verification and can be serialized for transport with [`bincode`].

use std::collections::BTreeMap;

use bytes::Bytes;
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::hash::Id;
use crate::storage::trie::key::{BranchFactor, Key};
use crate::storage::trie::mpt::MerkleTrie;
use crate::storage::trie::node::{hash_encoding, value_digest, Child, Node};

/// Proof errors
///
/// Authentication failures mean the proof does not match the claimed root
/// and its source should not be trusted. Structural errors mean the proof
/// is not even well-formed, and `Malformed` means it could not be decoded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProofError {
    /// Proof has no nodes
    #[error("Proof error: proof has no nodes")]
    EmptyProof,

    /// Range or change proof with no proof nodes and no data
    #[error("Proof error: no merkle proof")]
    NoMerkleProof,

    /// An end bound or data was given but the end proof is missing
    #[error("Proof error: missing end proof")]
    NoEndProof,

    /// A start bound was given but the start proof is missing
    #[error("Proof error: missing start proof")]
    NoStartProof,

    /// Start of the range is after its end
    #[error("Proof error: start key is after end key")]
    StartAfterEnd,

    /// First node of a proof is not the root
    #[error("Proof error: first proof node has key {0}, expected the root")]
    RootKeyNotEmpty(Key),

    /// A key is not a whole number of tokens
    #[error("Proof error: key {0} is not a whole number of tokens")]
    InvalidKeyLength(Key),

    /// A child token does not fit the branch factor
    #[error("Proof error: child token {0} out of range")]
    InvalidChildToken(u8),

    /// Proof node keys are not strictly increasing prefixes
    #[error("Proof error: proof node keys are not strictly increasing")]
    NonIncreasingProofNodes,

    /// A proof node is not a prefix of the proven key
    #[error("Proof error: proof node is not a prefix of the proven key")]
    ProofNodeNotForKey,

    /// A node whose key is not whole bytes claims a value
    #[error("Proof error: node {0} with a partial byte key has a value")]
    PartialByteLengthWithValue(Key),

    /// Keys are not sorted and unique
    #[error("Proof error: keys are not sorted in increasing order")]
    UnsortedKeys,

    /// A key lies outside the requested range
    #[error("Proof error: key outside the requested range")]
    KeyOutOfRange,

    /// Computed root differs from the expected one
    #[error("Proof error: invalid proof, expected root {expected} but got {actual}")]
    InvalidProof {
        /// Root the proof was checked against
        expected: Id,
        /// Root the proof actually commits to
        actual: Id,
    },

    /// A child entry's id does not match the next proof node
    #[error("Proof error: child id mismatch at {0}")]
    ChildIdMismatch(Key),

    /// A node has no child entry leading to the next proof node, or the
    /// entry's key disagrees with it
    #[error("Proof error: inconsistent child entry at {0}")]
    InconsistentChild(Key),

    /// A proof node's value differs from the claimed one
    #[error("Proof error: value mismatch at {0}")]
    ProofValueDoesntMatch(Key),

    /// A proof node in range has a value missing from the proof data
    #[error("Proof error: proof node {0} has a value not included in the proof")]
    ProofNodeHasUnincludedValue(Key),

    /// An exclusion proof stops short of a node that could hold the key
    #[error("Proof error: exclusion proof for {0} is incomplete")]
    ExclusionProofInvalidNode(Key),

    /// Proof bytes could not be decoded
    #[error("Proof error: malformed encoding: {0}")]
    Malformed(String),
}

impl ProofError {
    /// True iff the proof was well-formed but does not authenticate
    /// against the expected root
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            ProofError::InvalidProof { .. }
                | ProofError::ChildIdMismatch(_)
                | ProofError::InconsistentChild(_)
                | ProofError::ProofValueDoesntMatch(_)
                | ProofError::ProofNodeHasUnincludedValue(_)
                | ProofError::ExclusionProofInvalidNode(_)
        )
    }
}

impl From<bincode::Error> for ProofError {
    fn from(error: bincode::Error) -> Self {
        ProofError::Malformed(error.to_string())
    }
}

/// Result type for proof operations
pub type ProofResult<T> = Result<T, ProofError>;

/// Child entry of a proof node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofChild {
    /// Key bits between the parent's key plus token and the child's key
    pub compressed_key: Key,
    /// Id of the child node
    pub id: Id,
}

/// Snapshot of a trie node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofNode {
    /// Full key of the node
    pub key: Key,
    /// Value if shorter than 32 bytes, otherwise its hash
    pub value_or_hash: Option<Bytes>,
    /// Children by token
    pub children: BTreeMap<u8, ProofChild>,
}

impl ProofNode {
    /// Id of the node this snapshot was taken from
    pub fn calculate_id(&self) -> Id {
        Id::from_data(&hash_encoding(
            self.children
                .iter()
                .map(|(token, child)| (*token, &child.compressed_key, &child.id)),
            self.value_or_hash.as_deref(),
            &self.key,
        ))
    }

    /// Full key of the child at `token`
    pub fn child_key(&self, branch_factor: BranchFactor, token: u8) -> Option<Key> {
        self.children
            .get(&token)
            .map(|child| self.key.append_extend(branch_factor.token(token), &child.compressed_key))
    }
}

impl From<&Node> for ProofNode {
    fn from(node: &Node) -> Self {
        Self {
            key: node.key().clone(),
            value_or_hash: node.value_digest().cloned(),
            children: node
                .children()
                .iter()
                .map(|(token, child)| {
                    (
                        *token,
                        ProofChild {
                            compressed_key: child.compressed_key.clone(),
                            id: child.id,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Key/value pair returned by a range proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Bytes,
    pub value: Bytes,
}

/// Change to one key: its new value, or `None` if it was deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChange {
    pub key: Bytes,
    pub value: Option<Bytes>,
}

/// Inclusion or exclusion proof for a single key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// The key being proven
    pub key: Key,
    /// Its value, or `None` for an exclusion proof
    pub value: Option<Bytes>,
    /// Nodes from the root towards `key`
    pub path: Vec<ProofNode>,
}

impl Proof {
    /// Check the proof against `expected_root`.
    ///
    /// Each node's id is recomputed and checked against the child entry of
    /// its parent, and the root node's id against `expected_root`.
    pub fn verify(&self, expected_root: &Id, branch_factor: BranchFactor) -> ProofResult<()> {
        let result = self.verify_inner(expected_root, branch_factor);
        if let Err(e) = &result {
            warn!("Proof for key {} failed verification: {}", self.key, e);
        }
        result
    }

    fn verify_inner(&self, expected_root: &Id, branch_factor: BranchFactor) -> ProofResult<()> {
        let first = self.path.first().ok_or(ProofError::EmptyProof)?;
        if !first.key.is_empty() {
            return Err(ProofError::RootKeyNotEmpty(first.key.clone()));
        }
        if self.key.len() % branch_factor.bits_per_token() != 0 {
            return Err(ProofError::InvalidKeyLength(self.key.clone()));
        }
        validate_proof_nodes(&self.path, branch_factor)?;
        verify_proof_path(&self.path, Some(&self.key))?;

        let last = &self.path[self.path.len() - 1];
        if last.key == self.key {
            if !value_or_hash_matches(self.value.as_deref(), last.value_or_hash.as_ref()) {
                return Err(ProofError::ProofValueDoesntMatch(self.key.clone()));
            }
        } else {
            // The last node is either an ancestor of the key or the child
            // diverging from it; any value it holds belongs to another key.
            if self.value.is_some() {
                return Err(ProofError::ProofValueDoesntMatch(self.key.clone()));
            }
            // If the last node is an ancestor of the key, the proof must show
            // there is no child the key could live under.
            if self.key.has_strict_prefix(&last.key) {
                let token = self.key.token(last.key.len(), branch_factor.bits_per_token());
                if let Some(child_key) = last.child_key(branch_factor, token) {
                    if self.key.has_prefix(&child_key) {
                        return Err(ProofError::ExclusionProofInvalidNode(self.key.clone()));
                    }
                }
            }
        }

        verify_digest_chain(&self.path, branch_factor)?;

        let actual = first.calculate_id();
        if actual != *expected_root {
            return Err(ProofError::InvalidProof { expected: *expected_root, actual });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> ProofResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ProofResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Proof of the complete contents of a key range
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeProof {
    /// Proof of the range start, without the nodes it shares with `end_proof`
    pub start_proof: Vec<ProofNode>,
    /// Proof of the last key returned, or of the range end if none were
    pub end_proof: Vec<ProofNode>,
    /// All key/value pairs in the proven range, sorted by key
    pub key_values: Vec<KeyValue>,
}

impl RangeProof {
    /// Check that the proof proves all key/value pairs in
    /// `[start, largest]` under `expected_root`, where `largest` is the last
    /// returned key, or `end` when nothing was returned.
    pub fn verify(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        expected_root: &Id,
        branch_factor: BranchFactor,
    ) -> ProofResult<()> {
        let result = self.verify_inner(start, end, expected_root, branch_factor);
        if let Err(e) = &result {
            warn!("Range proof with {} key/values failed verification: {}", self.key_values.len(), e);
        }
        result
    }

    fn verify_inner(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        expected_root: &Id,
        branch_factor: BranchFactor,
    ) -> ProofResult<()> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(ProofError::StartAfterEnd);
            }
        }
        if self.key_values.is_empty() && self.start_proof.is_empty() && self.end_proof.is_empty() {
            return Err(ProofError::NoMerkleProof);
        }
        if self.end_proof.is_empty() && (end.is_some() || !self.key_values.is_empty()) {
            return Err(ProofError::NoEndProof);
        }

        validate_proof_nodes(&self.start_proof, branch_factor)?;
        validate_proof_nodes(&self.end_proof, branch_factor)?;
        verify_key_order(self.key_values.iter().map(|kv| &kv.key[..]), start, end)?;

        let smallest = start.map(Key::from_bytes);
        let largest = match self.key_values.last() {
            Some(kv) => Some(Key::from_bytes(&kv.key)),
            None => end.map(Key::from_bytes),
        };

        let key_values: BTreeMap<Key, Bytes> = self
            .key_values
            .iter()
            .map(|kv| (Key::from_bytes(&kv.key), kv.value.clone()))
            .collect();
        let lookup = |key: &Key| key_values.get(key).cloned();

        verify_proof_path(&self.start_proof, smallest.as_ref())?;
        verify_proof_values(&self.start_proof, smallest.as_ref(), largest.as_ref(), &lookup)?;
        verify_proof_path(&self.end_proof, largest.as_ref())?;
        verify_proof_values(&self.end_proof, smallest.as_ref(), largest.as_ref(), &lookup)?;

        let mut trie = MerkleTrie::standalone(branch_factor);
        for (key, value) in key_values {
            trie.insert(key, value);
        }
        add_path_info(&mut trie, &self.start_proof, smallest.as_ref(), largest.as_ref())?;
        add_path_info(&mut trie, &self.end_proof, smallest.as_ref(), largest.as_ref())?;

        let actual = trie.compute_root();
        if actual != *expected_root {
            return Err(ProofError::InvalidProof { expected: *expected_root, actual });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> ProofResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ProofResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Proof of the changes to a key range between two roots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeProof {
    /// Proof of the range start at the end root, without the nodes it
    /// shares with `end_proof`
    pub start_proof: Vec<ProofNode>,
    /// Proof of the last changed key at the end root, or of the range end
    pub end_proof: Vec<ProofNode>,
    /// Changed keys in the range, sorted by key
    pub key_changes: Vec<KeyChange>,
}

impl ChangeProof {
    /// True iff the proof carries no nodes and no changes
    pub fn is_empty(&self) -> bool {
        self.key_changes.is_empty() && self.start_proof.is_empty() && self.end_proof.is_empty()
    }

    /// Check that applying the changes to `base` within `[start, largest]`
    /// yields a trie with root `expected_root`, where `largest` is the last
    /// changed key, or `end` when there are no changes.
    ///
    /// Values of proof nodes in range that are not changed are checked
    /// against `base`.
    pub fn verify(
        &self,
        base: &MerkleTrie,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        expected_root: &Id,
    ) -> ProofResult<()> {
        let result = self.verify_inner(base, start, end, expected_root);
        if let Err(e) = &result {
            warn!("Change proof with {} changes failed verification: {}", self.key_changes.len(), e);
        }
        result
    }

    fn verify_inner(
        &self,
        base: &MerkleTrie,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        expected_root: &Id,
    ) -> ProofResult<()> {
        let branch_factor = base.branch_factor();
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(ProofError::StartAfterEnd);
            }
        }
        if self.is_empty() {
            return Err(ProofError::NoMerkleProof);
        }
        if end.is_some() && self.key_changes.is_empty() && self.end_proof.is_empty() {
            return Err(ProofError::NoEndProof);
        }
        // The start proof may be empty because all of its nodes are shared
        // with the end proof.
        if start.is_some() && self.start_proof.is_empty() && self.end_proof.is_empty() {
            return Err(ProofError::NoStartProof);
        }

        validate_proof_nodes(&self.start_proof, branch_factor)?;
        validate_proof_nodes(&self.end_proof, branch_factor)?;
        verify_key_order(self.key_changes.iter().map(|kc| &kc.key[..]), start, end)?;

        let smallest = start.map(Key::from_bytes);
        let largest = match self.key_changes.last() {
            Some(kc) => Some(Key::from_bytes(&kc.key)),
            None => end.map(Key::from_bytes),
        };

        verify_proof_path(&self.start_proof, smallest.as_ref())?;
        verify_proof_path(&self.end_proof, largest.as_ref())?;

        let changes: BTreeMap<Key, Option<Bytes>> = self
            .key_changes
            .iter()
            .map(|kc| (Key::from_bytes(&kc.key), kc.value.clone()))
            .collect();
        let lookup = |key: &Key| match changes.get(key) {
            Some(value) => value.clone(),
            None => base.get(key).cloned(),
        };
        verify_proof_values(&self.start_proof, smallest.as_ref(), largest.as_ref(), &lookup)?;
        verify_proof_values(&self.end_proof, smallest.as_ref(), largest.as_ref(), &lookup)?;

        let mut trie = base.clone();
        for (key, value) in changes {
            match value {
                Some(value) => trie.insert(key, value),
                None => {
                    trie.remove(&key);
                }
            }
        }
        add_path_info(&mut trie, &self.start_proof, smallest.as_ref(), largest.as_ref())?;
        add_path_info(&mut trie, &self.end_proof, smallest.as_ref(), largest.as_ref())?;

        let actual = trie.compute_root();
        if actual != *expected_root {
            return Err(ProofError::InvalidProof { expected: *expected_root, actual });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> ProofResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ProofResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Drop the leading nodes `start_proof` shares with `end_proof`
pub(crate) fn strip_shared_nodes(start_proof: Vec<ProofNode>, end_proof: &[ProofNode]) -> Vec<ProofNode> {
    let shared = start_proof
        .iter()
        .zip(end_proof)
        .take_while(|(a, b)| a.key == b.key)
        .count();
    start_proof.into_iter().skip(shared).collect()
}

/// True iff `value` is what a node with `value_or_hash` commits to
pub(crate) fn value_or_hash_matches(value: Option<&[u8]>, value_or_hash: Option<&Bytes>) -> bool {
    match (value, value_or_hash) {
        (None, None) => true,
        (Some(value), Some(digest)) => value_digest(value) == *digest,
        _ => false,
    }
}

/// Reject keys and child tokens that do not fit the branch factor
pub(crate) fn validate_proof_nodes(path: &[ProofNode], branch_factor: BranchFactor) -> ProofResult<()> {
    let bits = branch_factor.bits_per_token();
    for node in path {
        if node.key.len() % bits != 0 {
            return Err(ProofError::InvalidKeyLength(node.key.clone()));
        }
        for (token, child) in &node.children {
            if usize::from(*token) >= branch_factor.num_children() {
                return Err(ProofError::InvalidChildToken(*token));
            }
            if child.compressed_key.len() % bits != 0 {
                return Err(ProofError::InvalidKeyLength(child.compressed_key.clone()));
            }
        }
    }
    Ok(())
}

/// Check that each node's key is a strict prefix of the next and that every
/// node but the last is a strict prefix of `key`. The last node may diverge
/// from `key` in exclusion proofs.
pub(crate) fn verify_proof_path(path: &[ProofNode], key: Option<&Key>) -> ProofResult<()> {
    for (i, node) in path.iter().enumerate() {
        if node.key.has_partial_byte() && node.value_or_hash.is_some() {
            return Err(ProofError::PartialByteLengthWithValue(node.key.clone()));
        }
        let Some(next) = path.get(i + 1) else { break };
        if let Some(key) = key {
            if !key.has_strict_prefix(&node.key) {
                return Err(ProofError::ProofNodeNotForKey);
            }
        }
        if !next.key.has_strict_prefix(&node.key) {
            return Err(ProofError::NonIncreasingProofNodes);
        }
    }
    Ok(())
}

/// Check that every child entry leading to the next proof node matches that
/// node's key and recomputed id
fn verify_digest_chain(path: &[ProofNode], branch_factor: BranchFactor) -> ProofResult<()> {
    let bits = branch_factor.bits_per_token();
    for pair in path.windows(2) {
        let (parent, next) = (&pair[0], &pair[1]);
        let token = next.key.token(parent.key.len(), bits);
        let child = parent
            .children
            .get(&token)
            .ok_or_else(|| ProofError::InconsistentChild(parent.key.clone()))?;
        if parent.key.append_extend(branch_factor.token(token), &child.compressed_key) != next.key {
            return Err(ProofError::InconsistentChild(parent.key.clone()));
        }
        if child.id != next.calculate_id() {
            return Err(ProofError::ChildIdMismatch(next.key.clone()));
        }
    }
    Ok(())
}

/// Check that keys are strictly increasing and within `[start, end]`
pub(crate) fn verify_key_order<'a>(
    keys: impl Iterator<Item = &'a [u8]>,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
) -> ProofResult<()> {
    let mut previous: Option<&[u8]> = None;
    for key in keys {
        if previous.map_or(false, |p| key <= p) {
            return Err(ProofError::UnsortedKeys);
        }
        if start.map_or(false, |s| key < s) || end.map_or(false, |e| key > e) {
            return Err(ProofError::KeyOutOfRange);
        }
        previous = Some(key);
    }
    Ok(())
}

/// Check that every proof node holding a whole-byte key in
/// `[smallest, largest]` commits to the value `lookup` returns for it
pub(crate) fn verify_proof_values(
    path: &[ProofNode],
    smallest: Option<&Key>,
    largest: Option<&Key>,
    lookup: &dyn Fn(&Key) -> Option<Bytes>,
) -> ProofResult<()> {
    for node in path {
        if node.key.has_partial_byte()
            || smallest.map_or(false, |s| node.key < *s)
            || largest.map_or(false, |l| node.key > *l)
        {
            continue;
        }
        let expected = lookup(&node.key);
        if !value_or_hash_matches(expected.as_deref(), node.value_or_hash.as_ref()) {
            return Err(if expected.is_none() {
                ProofError::ProofNodeHasUnincludedValue(node.key.clone())
            } else {
                ProofError::ProofValueDoesntMatch(node.key.clone())
            });
        }
    }
    Ok(())
}

/// Add the proof nodes to `trie`, deepest first, together with their child
/// entries that lie entirely before `smallest` or after `largest`.
///
/// Children inside the range are left to the key/values already in the
/// trie, so the root only matches if those are complete.
pub(crate) fn add_path_info(
    trie: &mut MerkleTrie,
    path: &[ProofNode],
    smallest: Option<&Key>,
    largest: Option<&Key>,
) -> ProofResult<()> {
    let branch_factor = trie.branch_factor();
    for node in path.iter().rev() {
        if node.key.has_partial_byte() && node.value_or_hash.is_some() {
            return Err(ProofError::PartialByteLengthWithValue(node.key.clone()));
        }
        trie.insert_value_digest(&node.key, node.value_or_hash.clone());

        if smallest.is_none() && largest.is_none() {
            continue;
        }
        for (token, child) in &node.children {
            let child_key = node.key.append_extend(branch_factor.token(*token), &child.compressed_key);
            let before_range = smallest.map_or(false, |s| child_key < *s && !s.has_prefix(&child_key));
            let after_range = largest.map_or(false, |l| child_key > *l);
            if before_range || after_range {
                trie.set_placeholder_child(
                    &node.key,
                    *token,
                    Child {
                        compressed_key: child.compressed_key.clone(),
                        id: child.id,
                    },
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn sample_trie() -> MerkleTrie {
        let mut trie = MerkleTrie::standalone(BranchFactor::Sixteen);
        for (k, v) in [("alpha", "1"), ("alps", "2"), ("beta", "3"), ("bet", "4"), ("gamma", "5")] {
            trie.insert(Key::from_bytes(k.as_bytes()), bytes(v));
        }
        trie.compute_root();
        trie
    }

    #[test]
    fn test_inclusion_proof() {
        let trie = sample_trie();
        let root = trie.root_id().unwrap();
        for k in ["alpha", "alps", "beta", "bet", "gamma"] {
            let proof = trie.get_proof(&Key::from_bytes(k.as_bytes())).unwrap();
            assert!(proof.value.is_some());
            proof.verify(&root, BranchFactor::Sixteen).unwrap();
        }
    }

    #[test]
    fn test_exclusion_proof() {
        let trie = sample_trie();
        let root = trie.root_id().unwrap();
        for k in ["al", "alp", "b", "betas", "zeta", ""] {
            let proof = trie.get_proof(&Key::from_bytes(k.as_bytes())).unwrap();
            assert!(proof.value.is_none(), "{} should be absent", k);
            proof.verify(&root, BranchFactor::Sixteen).unwrap();
        }
    }

    #[test]
    fn test_proof_value_tampering() {
        let trie = sample_trie();
        let root = trie.root_id().unwrap();
        let mut proof = trie.get_proof(&Key::from_bytes(b"beta")).unwrap();
        proof.value = Some(bytes("forged"));
        let err = proof.verify(&root, BranchFactor::Sixteen).unwrap_err();
        assert_eq!(err, ProofError::ProofValueDoesntMatch(Key::from_bytes(b"beta")));
        assert!(err.is_authentication_failure());

        // Rewriting the last node to match the forged value breaks the chain
        let last = proof.path.len() - 1;
        proof.path[last].value_or_hash = Some(bytes("forged"));
        let err = proof.verify(&root, BranchFactor::Sixteen).unwrap_err();
        assert!(matches!(err, ProofError::ChildIdMismatch(_)));
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn test_proof_wrong_root() {
        let trie = sample_trie();
        let proof = trie.get_proof(&Key::from_bytes(b"gamma")).unwrap();
        let err = proof.verify(&Id::from_data(b"other"), BranchFactor::Sixteen).unwrap_err();
        assert!(matches!(err, ProofError::InvalidProof { .. }));
    }

    #[test]
    fn test_exclusion_proof_cannot_hide_key() {
        let trie = sample_trie();
        let root = trie.root_id().unwrap();
        let mut proof = trie.get_proof(&Key::from_bytes(b"alpha")).unwrap();
        // Drop the node holding the key and claim absence
        proof.path.pop();
        proof.value = None;
        let err = proof.verify(&root, BranchFactor::Sixteen).unwrap_err();
        assert_eq!(err, ProofError::ExclusionProofInvalidNode(Key::from_bytes(b"alpha")));
    }

    #[test]
    fn test_structural_errors() {
        let trie = sample_trie();
        let root = trie.root_id().unwrap();
        let proof = Proof { key: Key::from_bytes(b"x"), value: None, path: vec![] };
        assert_eq!(proof.verify(&root, BranchFactor::Sixteen), Err(ProofError::EmptyProof));

        let mut proof = trie.get_proof(&Key::from_bytes(b"beta")).unwrap();
        proof.path.swap(0, 1);
        let err = proof.verify(&root, BranchFactor::Sixteen).unwrap_err();
        assert!(!err.is_authentication_failure());
    }

    #[test]
    fn test_proof_bytes() {
        let trie = sample_trie();
        let proof = trie.get_proof(&Key::from_bytes(b"alps")).unwrap();
        let decoded = Proof::from_bytes(&proof.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, proof);
        assert!(matches!(Proof::from_bytes(&[1, 2, 3]), Err(ProofError::Malformed(_))));
    }

    #[test]
    fn test_proof_bytes_reject_huge_key_lengths() {
        let trie = sample_trie();
        let proof = trie.get_proof(&Key::from_bytes(b"alps")).unwrap();

        // The proven key's bit length comes first
        let mut encoded = proof.to_bytes().unwrap();
        encoded[..8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(Proof::from_bytes(&encoded), Err(ProofError::Malformed(_))));

        let mut encoded = proof.to_bytes().unwrap();
        encoded[..8].copy_from_slice(&(u64::MAX - 3).to_le_bytes());
        assert!(matches!(Proof::from_bytes(&encoded), Err(ProofError::Malformed(_))));

        // Start proof of a range proof: vec length, then the first node's key length
        let range = trie.get_range_proof(Some(b"alps"), None, 2).unwrap();
        let mut encoded = range.to_bytes().unwrap();
        encoded[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(RangeProof::from_bytes(&encoded), Err(ProofError::Malformed(_))));

        let change = ChangeProof { start_proof: range.start_proof, end_proof: range.end_proof, key_changes: Vec::new() };
        let mut encoded = change.to_bytes().unwrap();
        encoded[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(ChangeProof::from_bytes(&encoded), Err(ProofError::Malformed(_))));
    }

    #[test]
    fn test_range_proof() {
        let trie = sample_trie();
        let root = trie.root_id().unwrap();
        let bf = BranchFactor::Sixteen;

        // Whole trie
        let proof = trie.get_range_proof(None, None, 100).unwrap();
        assert_eq!(proof.key_values.len(), 5);
        proof.verify(None, None, &root, bf).unwrap();

        // Bounded range
        let proof = trie.get_range_proof(Some(b"alps"), Some(b"beta"), 100).unwrap();
        let keys: Vec<_> = proof.key_values.iter().map(|kv| kv.key.clone()).collect();
        assert_eq!(keys, vec![bytes("alps"), bytes("bet"), bytes("beta")]);
        proof.verify(Some(b"alps"), Some(b"beta"), &root, bf).unwrap();

        // Truncated by max length
        let proof = trie.get_range_proof(Some(b"a"), None, 2).unwrap();
        assert_eq!(proof.key_values.len(), 2);
        proof.verify(Some(b"a"), None, &root, bf).unwrap();

        // Empty range in the middle
        let proof = trie.get_range_proof(Some(b"c"), Some(b"d"), 10).unwrap();
        assert!(proof.key_values.is_empty());
        proof.verify(Some(b"c"), Some(b"d"), &root, bf).unwrap();
    }

    #[test]
    fn test_range_proof_detects_omission() {
        let trie = sample_trie();
        let root = trie.root_id().unwrap();
        let bf = BranchFactor::Sixteen;

        let mut proof = trie.get_range_proof(Some(b"alpha"), Some(b"gamma"), 100).unwrap();
        proof.key_values.remove(2);
        let err = proof.verify(Some(b"alpha"), Some(b"gamma"), &root, bf).unwrap_err();
        assert!(err.is_authentication_failure(), "{:?}", err);

        let mut proof = trie.get_range_proof(Some(b"alpha"), Some(b"gamma"), 100).unwrap();
        proof.key_values[1].value = bytes("forged");
        let err = proof.verify(Some(b"alpha"), Some(b"gamma"), &root, bf).unwrap_err();
        assert!(err.is_authentication_failure(), "{:?}", err);
    }

    #[test]
    fn test_range_proof_structural_errors() {
        let trie = sample_trie();
        let root = trie.root_id().unwrap();
        let bf = BranchFactor::Sixteen;

        assert_eq!(
            RangeProof::default().verify(None, None, &root, bf),
            Err(ProofError::NoMerkleProof)
        );
        assert_eq!(
            trie.get_range_proof(None, None, 10).unwrap().verify(Some(b"z"), Some(b"a"), &root, bf),
            Err(ProofError::StartAfterEnd)
        );

        let mut proof = trie.get_range_proof(None, None, 10).unwrap();
        proof.end_proof.clear();
        assert_eq!(proof.verify(None, None, &root, bf), Err(ProofError::NoEndProof));

        let mut proof = trie.get_range_proof(None, None, 10).unwrap();
        proof.key_values.swap(0, 1);
        assert_eq!(proof.verify(None, None, &root, bf), Err(ProofError::UnsortedKeys));

        let proof = trie.get_range_proof(None, None, 10).unwrap();
        assert_eq!(
            proof.verify(Some(b"b"), None, &root, bf),
            Err(ProofError::KeyOutOfRange)
        );
    }

    #[test]
    fn test_empty_trie_range_proof() {
        let mut trie = MerkleTrie::standalone(BranchFactor::Four);
        let root = trie.compute_root();
        let proof = trie.get_range_proof(None, None, 10).unwrap();
        assert_eq!(proof.end_proof.len(), 1);
        proof.verify(None, None, &root, BranchFactor::Four).unwrap();
    }

    #[test]
    fn test_large_values_use_hash() {
        let mut trie = MerkleTrie::standalone(BranchFactor::TwoFiftySix);
        let big = Bytes::from(vec![9u8; 100]);
        trie.insert(Key::from_bytes(b"big"), big.clone());
        let root = trie.compute_root();
        let proof = trie.get_proof(&Key::from_bytes(b"big")).unwrap();
        let last = proof.path.last().unwrap();
        assert_eq!(last.value_or_hash.as_ref().map(|v| v.len()), Some(32));
        assert_eq!(proof.value, Some(big));
        proof.verify(&root, BranchFactor::TwoFiftySix).unwrap();
    }

    #[test]
    fn test_change_proof_verification() {
        let base = sample_trie();

        let mut target = base.clone();
        target.insert(Key::from_bytes(b"beta"), bytes("33"));
        target.remove(&Key::from_bytes(b"bet"));
        target.insert(Key::from_bytes(b"delta"), bytes("6"));
        let target_root = target.compute_root();

        let changes = vec![
            KeyChange { key: bytes("bet"), value: None },
            KeyChange { key: bytes("beta"), value: Some(bytes("33")) },
            KeyChange { key: bytes("delta"), value: Some(bytes("6")) },
        ];
        let range = target.get_range_proof(Some(b"bet"), Some(b"delta"), 10).unwrap();
        let proof = ChangeProof {
            start_proof: range.start_proof,
            end_proof: range.end_proof,
            key_changes: changes,
        };
        proof.verify(&base, Some(b"bet"), Some(b"delta"), &target_root).unwrap();

        // Dropping a change breaks the proof
        let mut forged = proof.clone();
        forged.key_changes.remove(1);
        let err = forged.verify(&base, Some(b"bet"), Some(b"delta"), &target_root).unwrap_err();
        assert!(err.is_authentication_failure(), "{:?}", err);
    }
}
