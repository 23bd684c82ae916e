//! Proof iterator
//!
//! Replays a proof path as the ordered sequence of `(key prefix, id)` pairs
//! it proves: every proof node, and every child entry of a proof node that
//! is not itself elaborated further down the path. Each pair says "the
//! subtree rooted at this key has this id".
//!
//! The walk is a depth-first traversal over the proof nodes driven by an
//! explicit per-node cursor. A node's own pair comes first, then its
//! children in token order; the child leading to the next proof node is
//! replaced by the traversal of that node.

use crate::crypto::hash::Id;
use crate::storage::trie::key::{BranchFactor, Key};
use crate::storage::trie::proof::{validate_proof_nodes, verify_proof_path, ProofError, ProofNode, ProofResult};

/// Iterator over the key prefixes proven by a proof path
pub struct ProofIterator {
    /// Full key of each proof node
    node_keys: Vec<Key>,
    /// Id of each proof node: computed for the root of the path, taken from
    /// the parent's child entry for the rest
    node_ids: Vec<Id>,
    /// Token of the child leading to the next proof node, for all nodes but
    /// the last
    branch_tokens: Vec<usize>,
    /// Per node, child full key and id by token
    children: Vec<Vec<Option<(Key, Id)>>>,
    /// Node the walk is at
    node_index: usize,
    /// Per node cursor: `None` until the node's own pair is emitted, then
    /// the next token to look at. `num_children` means all children are
    /// done.
    next_child: Vec<Option<usize>>,
    /// Number of children per node
    num_children: usize,
    /// No more pairs
    exhausted: bool,
}

impl ProofIterator {
    /// Create an iterator over `path` that yields only prefixes `>= start`.
    /// `path` must be non-empty with strictly increasing node keys.
    pub fn new(path: &[ProofNode], start: &Key, branch_factor: BranchFactor) -> ProofResult<Self> {
        if path.is_empty() {
            return Err(ProofError::EmptyProof);
        }
        validate_proof_nodes(path, branch_factor)?;
        verify_proof_path(path, None)?;

        let bits = branch_factor.bits_per_token();
        let num_children = branch_factor.num_children();

        let node_keys: Vec<Key> = path.iter().map(|node| node.key.clone()).collect();

        let mut branch_tokens = Vec::with_capacity(path.len().saturating_sub(1));
        let mut node_ids = Vec::with_capacity(path.len());
        node_ids.push(path[0].calculate_id());
        for i in 0..path.len() - 1 {
            let token = node_keys[i + 1].token(node_keys[i].len(), bits);
            let child = path[i]
                .children
                .get(&token)
                .ok_or_else(|| ProofError::InconsistentChild(node_keys[i].clone()))?;
            branch_tokens.push(usize::from(token));
            node_ids.push(child.id);
        }

        let children = path
            .iter()
            .map(|node| {
                let mut slots: Vec<Option<(Key, Id)>> = vec![None; num_children];
                for (token, child) in &node.children {
                    let child_key = node.key.append_extend(branch_factor.token(*token), &child.compressed_key);
                    slots[usize::from(*token)] = Some((child_key, child.id));
                }
                slots
            })
            .collect();

        let mut iter = Self {
            node_keys,
            node_ids,
            branch_tokens,
            children,
            node_index: 0,
            next_child: vec![None; path.len()],
            num_children,
            exhausted: false,
        };
        iter.seek(start);
        Ok(iter)
    }

    /// Position the walk on the first pair whose key is `>= start`
    fn seek(&mut self, start: &Key) {
        let mut i = 0;
        loop {
            self.node_index = i;
            if self.node_keys[i] >= *start {
                return;
            }

            let mut descend = false;
            for token in 0..self.num_children {
                let Some((child_key, _)) = &self.children[i][token] else { continue };
                let is_branch = self.branch_tokens.get(i) == Some(&token);

                if *child_key >= *start {
                    if is_branch {
                        // Next pair is the next proof node itself.
                        self.next_child[i] = Some(token + 1);
                        self.node_index = i + 1;
                    } else {
                        self.next_child[i] = Some(token);
                    }
                    return;
                }

                if is_branch && start.has_prefix(child_key) {
                    // `start` falls inside the next proof node's subtree.
                    self.next_child[i] = Some(token + 1);
                    descend = true;
                    break;
                }
                // Whole subtree sorts before `start`.
            }

            if !descend {
                self.next_child[i] = Some(self.num_children);
                return;
            }
            i += 1;
        }
    }
}

impl Iterator for ProofIterator {
    type Item = (Key, Id);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.exhausted {
                return None;
            }
            let i = self.node_index;

            match self.next_child[i] {
                None => {
                    self.next_child[i] = Some(0);
                    return Some((self.node_keys[i].clone(), self.node_ids[i]));
                }
                Some(from) if from < self.num_children => {
                    let found = (from..self.num_children).find(|token| self.children[i][*token].is_some());
                    let Some(token) = found else {
                        self.next_child[i] = Some(self.num_children);
                        continue;
                    };
                    self.next_child[i] = Some(token + 1);
                    if self.branch_tokens.get(i) == Some(&token) {
                        self.node_index = i + 1;
                        continue;
                    }
                    return self.children[i][token].clone();
                }
                Some(_) => {
                    if i == 0 {
                        self.exhausted = true;
                        return None;
                    }
                    self.node_index = i - 1;
                }
            }
        }
    }
}
