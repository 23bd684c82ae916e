//! Merkle trie engine
//!
//! Nodes live in an ordered map keyed by their full key, so a node never
//! moves when edges above it are split or merged: only its parent's child
//! entry changes. The root node (empty key) always exists.
//!
//! Updates follow a two-phase protocol. `insert` and `remove` change values
//! and structure and mark every node on the path dirty; `compute_root`
//! rehashes the dirty nodes bottom-up and is the only point at which ids are
//! trustworthy.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace};
use thiserror::Error;

use crate::crypto::hash::Id;
use crate::storage::trie::key::{BranchFactor, Key};
use crate::storage::trie::metrics::{NoopMetrics, TrieMetrics};
use crate::storage::trie::node::{Child, Node};
use crate::storage::trie::proof::{strip_shared_nodes, KeyValue, Proof, ProofNode, RangeProof};

/// Trie errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrieError {
    /// Ids are stale until `compute_root` runs
    #[error("Trie error: uncommitted changes, compute the root first")]
    PendingChanges,

    /// A child entry points at a node that does not exist
    #[error("Trie error: missing node {0}")]
    MissingNode(Key),

    /// A stored child token does not fit the branch factor
    #[error("Trie error: child token {token} of node {key} out of range")]
    InvalidChildToken {
        /// Node holding the entry
        key: Key,
        /// Offending token
        token: u8,
    },
}

/// Result type for trie operations
pub type TrieResult<T> = Result<T, TrieError>;

/// Path-compressed merkle radix trie
#[derive(Clone)]
pub struct MerkleTrie {
    /// Children per node
    branch_factor: BranchFactor,
    /// All nodes by full key
    nodes: BTreeMap<Key, Node>,
    /// Keys of nodes added, modified or removed since the last `take_changed`
    changed: BTreeSet<Key>,
    /// Operation counters
    metrics: Arc<dyn TrieMetrics>,
}

impl MerkleTrie {
    /// Create an empty trie
    pub fn new(branch_factor: BranchFactor, metrics: Arc<dyn TrieMetrics>) -> Self {
        let root = Key::empty();
        let mut nodes = BTreeMap::new();
        nodes.insert(root.clone(), Node::new(root));
        Self {
            branch_factor,
            nodes,
            changed: BTreeSet::new(),
            metrics,
        }
    }

    /// Create an empty trie that records no metrics, used for verification
    pub fn standalone(branch_factor: BranchFactor) -> Self {
        Self::new(branch_factor, Arc::new(NoopMetrics))
    }

    /// Rebuild a trie from stored nodes. Every child entry must point at a
    /// node in `nodes`. The nodes are dirty until `compute_root` runs.
    pub fn from_nodes(
        branch_factor: BranchFactor,
        metrics: Arc<dyn TrieMetrics>,
        nodes: impl IntoIterator<Item = Node>,
    ) -> TrieResult<Self> {
        let mut trie = Self::new(branch_factor, metrics);
        for node in nodes {
            trie.nodes.insert(node.key().clone(), node);
        }

        for (key, node) in &trie.nodes {
            for (token, child) in node.children() {
                if usize::from(*token) >= branch_factor.num_children() {
                    return Err(TrieError::InvalidChildToken { key: key.clone(), token: *token });
                }
                let child_key = key.append_extend(branch_factor.token(*token), &child.compressed_key);
                if !trie.nodes.contains_key(&child_key) {
                    return Err(TrieError::MissingNode(child_key));
                }
            }
        }
        debug!("Loaded trie with {} nodes", trie.nodes.len());
        Ok(trie)
    }

    pub fn branch_factor(&self) -> BranchFactor {
        self.branch_factor
    }

    /// Root id, if no changes are pending
    pub fn root_id(&self) -> TrieResult<Id> {
        self.nodes
            .get(&Key::empty())
            .and_then(Node::id)
            .ok_or(TrieError::PendingChanges)
    }

    /// Value stored at `key`
    pub fn get(&self, key: &Key) -> Option<&Bytes> {
        self.nodes.get(key).and_then(Node::value)
    }

    pub fn get_node(&self, key: &Key) -> Option<&Node> {
        self.nodes.get(key)
    }

    /// Number of nodes, including the root
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All stored key/value pairs in key order
    pub fn values(&self) -> impl Iterator<Item = (&Key, &Bytes)> {
        self.nodes.iter().filter_map(|(key, node)| node.value().map(|value| (key, value)))
    }

    /// True iff no values are stored
    pub fn is_empty(&self) -> bool {
        self.values().next().is_none()
    }

    /// Keys of nodes touched since the last call. Keys whose node no longer
    /// exists were removed.
    pub fn take_changed(&mut self) -> BTreeSet<Key> {
        std::mem::take(&mut self.changed)
    }

    /// Set the value at `key`
    pub fn insert(&mut self, key: Key, value: Bytes) {
        if self.get(&key) == Some(&value) {
            return;
        }
        let ancestors = self.ensure_node(&key);
        for ancestor in &ancestors {
            self.touch(ancestor);
        }
        self.node_mut(&key).set_value(Some(value));
        trace!("Inserted {}", key);
        self.changed.insert(key);
    }

    /// Remove the value at `key`, pruning nodes left without a value and
    /// with fewer than two children. Returns the removed value.
    pub fn remove(&mut self, key: &Key) -> Option<Bytes> {
        let old = self.get(key)?.clone();
        let path = self.path_to(key);
        if path.last() != Some(key) {
            return None;
        }

        self.node_mut(key).set_value(None);
        self.changed.insert(key.clone());
        let ancestors = &path[..path.len() - 1];
        for ancestor in ancestors {
            self.touch(ancestor);
        }

        if let Some(parent) = ancestors.last() {
            let grandparent = ancestors.len().checked_sub(2).map(|i| &ancestors[i]);
            self.prune(key, parent, grandparent);
        }
        trace!("Removed {}", key);
        Some(old)
    }

    /// Rehash all dirty nodes, children before parents, and return the
    /// root id
    pub fn compute_root(&mut self) -> Id {
        let metrics = Arc::clone(&self.metrics);
        let mut stack: Vec<(Key, bool)> = vec![(Key::empty(), false)];
        let mut hashed = 0usize;

        while let Some((key, children_done)) = stack.pop() {
            let Some(node) = self.nodes.get(&key) else { continue };
            if !node.is_dirty() {
                continue;
            }

            if !children_done {
                stack.push((key.clone(), true));
                for token in node.children().keys() {
                    if let Some(child_key) = node.child_key(self.branch_factor, *token) {
                        if self.nodes.get(&child_key).map_or(false, Node::is_dirty) {
                            stack.push((child_key, false));
                        }
                    }
                }
                continue;
            }

            // Entries without a node keep their recorded id.
            let child_ids: Vec<(u8, Id)> = node
                .children()
                .keys()
                .filter_map(|token| {
                    let child_key = node.child_key(self.branch_factor, *token)?;
                    let id = self.nodes.get(&child_key)?.id()?;
                    Some((*token, id))
                })
                .collect();
            if let Some(node) = self.nodes.get_mut(&key) {
                for (token, id) in child_ids {
                    node.set_child_id(token, id);
                }
                node.calculate_id(metrics.as_ref());
                hashed += 1;
            }
        }

        let root = self.node_mut(&Key::empty()).calculate_id(metrics.as_ref());
        debug!("Computed root {} ({} nodes rehashed)", root, hashed);
        root
    }

    /// Inclusion proof for `key`, or exclusion proof if it has no value.
    ///
    /// An exclusion proof ends at the deepest node that is a prefix of
    /// `key`, followed by that node's child at the next token of `key` if
    /// there is one.
    pub fn get_proof(&self, key: &Key) -> TrieResult<Proof> {
        self.root_id()?;
        let bits = self.branch_factor.bits_per_token();
        let path_keys = self.path_to(key);
        let mut path: Vec<ProofNode> = path_keys
            .iter()
            .filter_map(|k| self.nodes.get(k))
            .map(ProofNode::from)
            .collect();

        if let Some(last) = path_keys.last().and_then(|k| self.nodes.get(k)) {
            if last.key() != key && key.len() >= last.key().len() + bits {
                let token = key.token(last.key().len(), bits);
                if let Some(child) = last
                    .child_key(self.branch_factor, token)
                    .and_then(|child_key| self.nodes.get(&child_key))
                {
                    path.push(ProofNode::from(child));
                }
            }
        }

        Ok(Proof {
            key: key.clone(),
            value: self.get(key).cloned(),
            path,
        })
    }

    /// Up to `max_length` key/value pairs in `[start, end]`
    pub fn key_values(&self, start: Option<&[u8]>, end: Option<&[u8]>, max_length: usize) -> Vec<KeyValue> {
        let from = start.map(Key::from_bytes).unwrap_or_default();
        self.nodes
            .range(from..)
            .filter_map(|(key, node)| node.value().map(|value| (key, value)))
            .take_while(|(key, _)| end.map_or(true, |end| key.as_bytes() <= end))
            .take(max_length)
            .map(|(key, value)| KeyValue {
                key: key.bytes(),
                value: value.clone(),
            })
            .collect()
    }

    /// Proof of the key/value pairs in `[start, end]`, limited to
    /// `max_length` pairs. The end proof is for the last pair returned, or
    /// for `end` if there are none. An empty range yields the root proof.
    pub fn get_range_proof(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max_length: usize,
    ) -> TrieResult<RangeProof> {
        self.root_id()?;
        let key_values = self.key_values(start, end, max_length);

        let end_key = match key_values.last() {
            Some(kv) => Some(Key::from_bytes(&kv.key)),
            None => end.map(Key::from_bytes),
        };
        let mut end_proof = match &end_key {
            Some(key) => self.get_proof(key)?.path,
            None => Vec::new(),
        };
        let start_proof = match start {
            Some(start) => strip_shared_nodes(self.get_proof(&Key::from_bytes(start))?.path, &end_proof),
            None => Vec::new(),
        };

        if start_proof.is_empty() && end_proof.is_empty() && key_values.is_empty() {
            end_proof = self.get_proof(&Key::empty())?.path;
        }

        Ok(RangeProof {
            start_proof,
            end_proof,
            key_values,
        })
    }

    /// Make sure a node exists at `key`, creating it and splitting the
    /// edge it falls on if needed. Returns the keys of its ancestors, root
    /// first.
    fn ensure_node(&mut self, key: &Key) -> Vec<Key> {
        let branch_factor = self.branch_factor;
        let bits = branch_factor.bits_per_token();
        let mut ancestors = Vec::new();
        let mut current = Key::empty();

        loop {
            let node = self.node_mut(&current);
            if &current == key {
                return ancestors;
            }

            let token = key.token(current.len(), bits);
            let Some(child) = node.child(token).cloned() else {
                node.add_child_with_id(branch_factor, key, Id::EMPTY);
                self.node_mut(key);
                ancestors.push(current);
                return ancestors;
            };

            let child_key = current.append_extend(branch_factor.token(token), &child.compressed_key);
            if key.has_prefix(&child_key) {
                ancestors.push(current);
                current = child_key;
                continue;
            }

            // The edge to the child diverges from `key`: put a branch node at
            // the longest common prefix and hang both below it.
            let common = key.common_prefix_len(&child_key, current.len() + bits, bits);
            let branch_key = key.take(common);
            node.add_child_with_id(branch_factor, &branch_key, Id::EMPTY);

            let mut branch = Node::new(branch_key.clone());
            branch.add_child_with_id(branch_factor, &child_key, child.id);
            ancestors.push(current);
            if &branch_key != key {
                branch.add_child_with_id(branch_factor, key, Id::EMPTY);
                self.node_mut(key);
                ancestors.push(branch_key.clone());
            }
            self.changed.insert(branch_key.clone());
            self.nodes.insert(branch_key, branch);
            return ancestors;
        }
    }

    /// Keys of the existing nodes on the way from the root to `key`,
    /// ending with `key` itself if it has a node
    fn path_to(&self, key: &Key) -> Vec<Key> {
        let bits = self.branch_factor.bits_per_token();
        let mut path = Vec::new();
        let mut current = Key::empty();

        while let Some(node) = self.nodes.get(&current) {
            path.push(current.clone());
            if current.len() + bits > key.len() {
                break;
            }
            let token = key.token(current.len(), bits);
            match node.child_key(self.branch_factor, token) {
                Some(child_key) if key.has_prefix(&child_key) => current = child_key,
                _ => break,
            }
        }
        path
    }

    /// Remove the node at `key` if it has no value and fewer than two
    /// children, merging its only child into the parent's entry
    fn prune(&mut self, key: &Key, parent: &Key, grandparent: Option<&Key>) {
        let Some(node) = self.nodes.get(key) else { return };
        if node.has_value() || node.children().len() >= 2 {
            return;
        }

        let branch_factor = self.branch_factor;
        let bits = branch_factor.bits_per_token();
        let token = key.token(parent.len(), bits);
        let only_child = node.children().iter().next().map(|(t, c)| (*t, c.clone()));

        self.nodes.remove(key);
        self.changed.insert(key.clone());

        match only_child {
            None => {
                if let Some(parent_node) = self.nodes.get_mut(parent) {
                    parent_node.remove_child(token);
                }
                // The parent may now be a valueless node with one child.
                if let Some(grandparent) = grandparent {
                    self.prune(parent, grandparent, None);
                }
            }
            Some((child_token, child)) => {
                let child_key = key.append_extend(branch_factor.token(child_token), &child.compressed_key);
                if let Some(parent_node) = self.nodes.get_mut(parent) {
                    parent_node.set_child(
                        token,
                        Child {
                            compressed_key: child_key.skip(parent.len() + bits),
                            id: child.id,
                        },
                    );
                }
            }
        }
    }

    /// Node at `key`, created empty if missing
    fn node_mut(&mut self, key: &Key) -> &mut Node {
        if !self.nodes.contains_key(key) {
            self.changed.insert(key.clone());
        }
        self.nodes
            .entry(key.clone())
            .or_insert_with(|| Node::new(key.clone()))
    }

    fn touch(&mut self, key: &Key) {
        self.node_mut(key).mark_dirty();
        self.changed.insert(key.clone());
    }

    /// Create or update the node at `key` with a value digest taken from a
    /// proof
    pub(crate) fn insert_value_digest(&mut self, key: &Key, digest: Option<Bytes>) {
        let ancestors = self.ensure_node(key);
        for ancestor in &ancestors {
            self.touch(ancestor);
        }
        self.node_mut(key).set_value_digest(digest);
    }

    /// Record a child entry whose subtree is known only by its id. The node
    /// at `key` must have been inserted already so its ancestors are dirty.
    ///
    /// Local nodes below that token are dropped, so `compute_root` keeps the
    /// recorded id instead of rehashing a local subtree that may differ.
    pub(crate) fn set_placeholder_child(&mut self, key: &Key, token: u8, child: Child) {
        let subtree = key.append(self.branch_factor.token(token));
        let stale: Vec<Key> = self
            .nodes
            .range(subtree.clone()..)
            .map(|(k, _)| k)
            .take_while(|k| k.has_prefix(&subtree))
            .cloned()
            .collect();
        for stale_key in stale {
            self.nodes.remove(&stale_key);
            self.changed.insert(stale_key);
        }
        self.node_mut(key).set_child(token, child);
    }
}
