//! Merkle database
//!
//! Ties a [`MerkleTrie`] to a [`KVStore`] and a bounded [`TrieHistory`].
//! Every commit rehashes the trie, writes the changed node encodings and the
//! new root to the store as one atomic batch, and records the commit in the
//! history so change proofs and proofs at recent roots can be served.
//!
//! Store layout:
//! - `n:` + encoded node key -> storage encoding of the node
//! - `m:root` -> root id of the last commit
//! - `m:branch_factor` -> branch factor the trie was built with

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use thiserror::Error;

use crate::config::{Config, MerkleConfig};
use crate::crypto::hash::Id;
use crate::storage::kv_store::{KVStore, KVStoreError, WriteBatchOperation, WriteBatchOperationExt};
use crate::storage::open_store;
use crate::storage::trie::codec::{write_key, CodecError, Reader};
use crate::storage::trie::history::{ChangeSummary, HistoryLookupError, TrieHistory, ValueChange};
use crate::storage::trie::key::{BranchFactor, Key};
use crate::storage::trie::metrics::{TrieCounters, TrieMetrics, TrieStats};
use crate::storage::trie::mpt::{MerkleTrie, TrieError};
use crate::storage::trie::node::Node;
use crate::storage::trie::proof::{
    strip_shared_nodes, ChangeProof, KeyChange, Proof, ProofError, ProofNode, RangeProof,
};

const NODE_PREFIX: &[u8] = b"n:";
const ROOT_KEY: &[u8] = b"m:root";
const BRANCH_FACTOR_KEY: &[u8] = b"m:branch_factor";

/// Error type for database operations
#[derive(Debug, Error)]
pub enum MerkleDbError {
    /// KV store error
    #[error("KV store error: {0}")]
    KVStoreError(#[from] KVStoreError),

    /// Stored node failed to decode
    #[error("{0}")]
    CodecError(#[from] CodecError),

    /// Proof failed verification
    #[error("{0}")]
    ProofError(#[from] ProofError),

    /// Trie error
    #[error("{0}")]
    TrieError(#[from] TrieError),

    /// Start root is older than the retained history
    #[error("Insufficient history to serve root {0}")]
    InsufficientHistory(Id),

    /// End root was never committed or has left the history
    #[error("End root {0} not found in history")]
    NoEndRoot(Id),

    /// Change proof requested between a root and itself
    #[error("Start and end root are both {0}")]
    SameRoot(Id),

    /// Range start is after range end
    #[error("Range start is after range end")]
    StartAfterEnd,

    /// Zero key limit
    #[error("Max length must be positive")]
    InvalidMaxLength,

    /// Store contents are inconsistent with each other
    #[error("Corrupted store: {0}")]
    CorruptedStore(String),

    /// Store was built with another branch factor
    #[error("Store uses branch factor {stored}, configured {configured}")]
    BranchFactorMismatch {
        /// Branch factor in the store
        stored: u32,
        /// Branch factor in the configuration
        configured: BranchFactor,
    },
}

/// Result type for database operations
pub type MerkleDbResult<T> = Result<T, MerkleDbError>;

/// Authenticated key/value database
pub struct MerkleDb {
    /// Backing store
    store: Arc<dyn KVStore>,
    /// In-memory trie, always clean between calls
    trie: MerkleTrie,
    /// Recent commits
    history: TrieHistory,
    /// Trie operation counters
    counters: Arc<TrieCounters>,
    /// Root of the last commit
    root: Id,
}

impl MerkleDb {
    /// Open the database kept in `store`, or initialise an empty one
    pub fn new(store: Arc<dyn KVStore>, config: &MerkleConfig) -> MerkleDbResult<Self> {
        let branch_factor = config.branch_factor;
        match store.get(BRANCH_FACTOR_KEY)? {
            Some(bytes) => {
                let stored = <[u8; 4]>::try_from(bytes.as_slice())
                    .map(u32::from_be_bytes)
                    .map_err(|_| MerkleDbError::CorruptedStore("branch factor record".to_string()))?;
                if stored != u32::from(branch_factor) {
                    return Err(MerkleDbError::BranchFactorMismatch { stored, configured: branch_factor });
                }
            }
            None => store.put(BRANCH_FACTOR_KEY, &u32::from(branch_factor).to_be_bytes())?,
        }

        let counters = Arc::new(TrieCounters::new());
        let mut nodes = Vec::new();
        for (storage_key, bytes) in store.scan_prefix(NODE_PREFIX)? {
            let mut reader = Reader::new(&storage_key[NODE_PREFIX.len()..]);
            let key = reader.read_key()?;
            reader.finish()?;
            nodes.push(Node::parse(key, &bytes)?);
            counters.node_read();
        }
        let node_count = nodes.len();

        let mut trie = if nodes.is_empty() {
            MerkleTrie::new(branch_factor, counters.clone())
        } else {
            MerkleTrie::from_nodes(branch_factor, counters.clone(), nodes)?
        };
        let root = trie.compute_root();
        trie.take_changed();

        match store.get(ROOT_KEY)? {
            Some(stored) => {
                let stored = Id::from_slice(&stored)
                    .ok_or_else(|| MerkleDbError::CorruptedStore("root record".to_string()))?;
                if stored != root {
                    return Err(MerkleDbError::CorruptedStore(format!(
                        "stored root {} but nodes hash to {}",
                        stored, root
                    )));
                }
            }
            None if node_count > 0 => {
                return Err(MerkleDbError::CorruptedStore("nodes without a root record".to_string()));
            }
            None => store.put(ROOT_KEY, root.as_bytes())?,
        }

        let mut history = TrieHistory::new(config.history_length);
        history.record(ChangeSummary { root_id: root, values: BTreeMap::new() });

        info!("Opened merkle db with {} nodes, root {}", node_count, root);
        Ok(Self { store, trie, history, counters, root })
    }

    /// Open the database described by `config`
    pub fn open(config: &Config) -> MerkleDbResult<Self> {
        let store = open_store(&config.storage)?;
        Self::new(store, &config.merkle)
    }

    pub fn branch_factor(&self) -> BranchFactor {
        self.trie.branch_factor()
    }

    /// Value stored at `key`
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.trie.get(&Key::from_bytes(key)).cloned()
    }

    /// Root of the last commit
    pub fn merkle_root(&self) -> Id {
        self.root
    }

    /// The committed trie
    pub fn trie(&self) -> &MerkleTrie {
        &self.trie
    }

    /// True iff `root` is still in the history
    pub fn has_root(&self, root: &Id) -> bool {
        self.history.contains(root)
    }

    /// Trie operation counts since the database was opened
    pub fn stats(&self) -> TrieStats {
        self.counters.stats()
    }

    /// Set `key` to `value`
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> MerkleDbResult<Id> {
        self.commit(vec![KeyChange {
            key: Bytes::copy_from_slice(key),
            value: Some(Bytes::copy_from_slice(value)),
        }])
    }

    /// Delete `key`
    pub fn delete(&mut self, key: &[u8]) -> MerkleDbResult<Id> {
        self.commit(vec![KeyChange { key: Bytes::copy_from_slice(key), value: None }])
    }

    /// Apply `changes` in order as one commit and return the new root. Later
    /// changes to the same key win.
    pub fn commit(&mut self, changes: Vec<KeyChange>) -> MerkleDbResult<Id> {
        let mut values: BTreeMap<Key, ValueChange> = BTreeMap::new();
        for change in changes {
            let key = Key::from_bytes(&change.key);
            let before = self.trie.get(&key).cloned();
            match &change.value {
                Some(value) => self.trie.insert(key.clone(), value.clone()),
                None => {
                    self.trie.remove(&key);
                }
            }
            values
                .entry(key)
                .and_modify(|existing| existing.after = change.value.clone())
                .or_insert(ValueChange { before, after: change.value });
        }
        values.retain(|_, change| change.before != change.after);

        let root = self.trie.compute_root();
        if let Err(e) = self.persist(&root) {
            warn!("Commit of {} changes failed, reverting: {}", values.len(), e);
            self.revert(&values);
            return Err(e);
        }

        debug!("Committed {} changes, root {} -> {}", values.len(), self.root, root);
        self.root = root;
        self.history.record(ChangeSummary { root_id: root, values });
        Ok(root)
    }

    /// Write changed nodes and the root to the store in one batch
    fn persist(&mut self, root: &Id) -> MerkleDbResult<()> {
        let mut batch: Vec<WriteBatchOperation> = Vec::new();
        for key in self.trie.take_changed() {
            match self.trie.get_node(&key) {
                Some(node) => {
                    batch.put(node_storage_key(&key), node.serialize());
                    self.counters.node_written();
                }
                None => batch.delete(node_storage_key(&key)),
            }
        }
        batch.put(ROOT_KEY.to_vec(), root.as_bytes().to_vec());
        debug!("Writing batch of {} operations", batch.len());
        self.store.write_batch(batch)?;
        Ok(())
    }

    /// Undo uncommitted `values`. The resulting structure is identical to
    /// the one in the store, so nothing needs to be written.
    fn revert(&mut self, values: &BTreeMap<Key, ValueChange>) {
        for (key, change) in values {
            match &change.before {
                Some(value) => self.trie.insert(key.clone(), value.clone()),
                None => {
                    self.trie.remove(key);
                }
            }
        }
        self.trie.compute_root();
        self.trie.take_changed();
    }

    /// Delete every key in `[start, end]`
    pub fn clear_range(&mut self, start: Option<&[u8]>, end: Option<&[u8]>) -> MerkleDbResult<Id> {
        check_range(start, end)?;
        let deletions = self
            .trie
            .key_values(start, end, usize::MAX)
            .into_iter()
            .map(|kv| KeyChange { key: kv.key, value: None })
            .collect();
        self.commit(deletions)
    }

    /// Inclusion or exclusion proof for `key` at the current root
    pub fn get_proof(&self, key: &[u8]) -> MerkleDbResult<Proof> {
        Ok(self.trie.get_proof(&Key::from_bytes(key))?)
    }

    /// Range proof for up to `max_length` pairs in `[start, end]` at the
    /// current root
    pub fn get_range_proof(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max_length: usize,
    ) -> MerkleDbResult<RangeProof> {
        check_range(start, end)?;
        check_max_length(max_length)?;
        Ok(self.trie.get_range_proof(start, end, max_length)?)
    }

    /// Range proof at `root`, which must be the current root or one in the
    /// history
    pub fn get_range_proof_at_root(
        &self,
        root: &Id,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max_length: usize,
    ) -> MerkleDbResult<RangeProof> {
        check_range(start, end)?;
        check_max_length(max_length)?;
        if *root == self.root {
            return Ok(self.trie.get_range_proof(start, end, max_length)?);
        }
        let trie = self.trie_at_root(root)?;
        Ok(trie.get_range_proof(start, end, max_length)?)
    }

    /// Proof of the changes to keys in `[start, end]` between two roots in
    /// the history, limited to `max_length` changes
    pub fn get_change_proof(
        &self,
        start_root: &Id,
        end_root: &Id,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max_length: usize,
    ) -> MerkleDbResult<ChangeProof> {
        check_range(start, end)?;
        check_max_length(max_length)?;
        if start_root == end_root {
            return Err(MerkleDbError::SameRoot(*start_root));
        }

        let start_key = start.map(Key::from_bytes);
        let end_key = end.map(Key::from_bytes);
        let changes = self
            .history
            .get_value_changes(start_root, end_root, start_key.as_ref(), end_key.as_ref(), max_length)
            .map_err(|e| match e {
                HistoryLookupError::NoEndRoot => MerkleDbError::NoEndRoot(*end_root),
                HistoryLookupError::InsufficientHistory => MerkleDbError::InsufficientHistory(*start_root),
            })?;

        let historical;
        let trie = if *end_root == self.root {
            &self.trie
        } else {
            historical = self.trie_at_root(end_root)?;
            &historical
        };

        let key_changes: Vec<KeyChange> = changes
            .into_iter()
            .map(|(key, change)| KeyChange { key: key.bytes(), value: change.after })
            .collect();

        let largest = match key_changes.last() {
            Some(kc) => Some(Key::from_bytes(&kc.key)),
            None => end_key,
        };
        let mut end_proof: Vec<ProofNode> = match &largest {
            Some(key) => trie.get_proof(key)?.path,
            None => Vec::new(),
        };
        let start_proof = match &start_key {
            Some(key) => strip_shared_nodes(trie.get_proof(key)?.path, &end_proof),
            None => Vec::new(),
        };
        if start_proof.is_empty() && end_proof.is_empty() && key_changes.is_empty() {
            end_proof = trie.get_proof(&Key::empty())?.path;
        }

        Ok(ChangeProof { start_proof, end_proof, key_changes })
    }

    /// Check that applying `proof` to this database yields `expected_root`
    /// within `[start, end]`. Does not modify the database.
    pub fn verify_change_proof(
        &self,
        proof: &ChangeProof,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        expected_root: &Id,
    ) -> MerkleDbResult<()> {
        proof.verify(&self.trie, start, end, expected_root)?;
        Ok(())
    }

    /// Apply the changes of a verified change proof as one commit
    pub fn commit_change_proof(&mut self, proof: &ChangeProof) -> MerkleDbResult<Id> {
        self.commit(proof.key_changes.clone())
    }

    /// Replace the contents of `[start, largest]` with the pairs of a
    /// verified range proof, where `largest` is its last key, or `end` when
    /// it has none
    pub fn commit_range_proof(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        proof: &RangeProof,
    ) -> MerkleDbResult<Id> {
        check_range(start, end)?;
        let largest = match proof.key_values.last() {
            Some(kv) => Some(kv.key.clone()),
            None => end.map(Bytes::copy_from_slice),
        };

        let incoming: BTreeSet<&[u8]> = proof.key_values.iter().map(|kv| &kv.key[..]).collect();
        let mut changes: Vec<KeyChange> = self
            .trie
            .key_values(start, largest.as_deref(), usize::MAX)
            .into_iter()
            .filter(|kv| !incoming.contains(&kv.key[..]))
            .map(|kv| KeyChange { key: kv.key, value: None })
            .collect();
        changes.extend(proof.key_values.iter().map(|kv| KeyChange {
            key: kv.key.clone(),
            value: Some(kv.value.clone()),
        }));
        self.commit(changes)
    }

    /// Copy of the trie as it was at `root`, rebuilt by undoing newer commits
    fn trie_at_root(&self, root: &Id) -> MerkleDbResult<MerkleTrie> {
        let summaries = self
            .history
            .changes_since(root)
            .ok_or(MerkleDbError::InsufficientHistory(*root))?;
        let mut trie = self.trie.clone();
        for summary in summaries {
            for (key, change) in &summary.values {
                match &change.before {
                    Some(value) => trie.insert(key.clone(), value.clone()),
                    None => {
                        trie.remove(key);
                    }
                }
            }
        }
        let rebuilt = trie.compute_root();
        trie.take_changed();
        if rebuilt != *root {
            return Err(MerkleDbError::CorruptedStore(format!(
                "history rebuilds root {} instead of {}",
                rebuilt, root
            )));
        }
        Ok(trie)
    }
}

fn node_storage_key(key: &Key) -> Vec<u8> {
    let mut storage_key = NODE_PREFIX.to_vec();
    write_key(&mut storage_key, key);
    storage_key
}

fn check_range(start: Option<&[u8]>, end: Option<&[u8]>) -> MerkleDbResult<()> {
    match (start, end) {
        (Some(start), Some(end)) if start > end => Err(MerkleDbError::StartAfterEnd),
        _ => Ok(()),
    }
}

fn check_max_length(max_length: usize) -> MerkleDbResult<()> {
    if max_length == 0 {
        return Err(MerkleDbError::InvalidMaxLength);
    }
    Ok(())
}
