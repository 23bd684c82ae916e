//! Trie node model
//!
//! A node is stored under its full key. It holds an optional value and up to
//! branch-factor children; each child entry records the compressed key
//! between this node and the child (the bits after the child's token) and
//! the child's id.
//!
//! Two encodings exist for a node:
//!
//! - the **hash encoding**, whose SHA-256 is the node id:
//!   child count, then per child in ascending token order the token, the
//!   compressed key and the child id, then the value digest (presence flag
//!   plus bytes) and finally the node's own key;
//! - the **storage encoding** written by [`Node::serialize`]:
//!   the value (presence flag plus bytes), child count, then per child the
//!   token, compressed key and child id. The node key is the storage key and
//!   is not repeated.

use std::collections::BTreeMap;

use bytes::Bytes;
use log::trace;

use crate::crypto::hash::{sha256, Id, ID_LEN};
use crate::storage::trie::codec::{
    write_id, write_key, write_maybe_bytes, write_uvarint, CodecError, CodecResult, Reader,
};
use crate::storage::trie::key::{BranchFactor, Key};
use crate::storage::trie::metrics::TrieMetrics;

/// Most children any node can have
pub const MAX_CHILDREN: usize = 256;

/// Child entry of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Child {
    /// Key bits between the parent's key plus token and the child's key
    pub compressed_key: Key,
    /// Id of the child node
    pub id: Id,
}

/// Whether a node's id is current
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    /// Modified since the id was last computed
    Dirty,
    /// Id is up to date
    Clean(Id),
}

/// A node of the merkle trie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Full key of the node
    key: Key,
    /// Stored value
    value: Option<Bytes>,
    /// Value, or its hash when the value is 32 bytes or longer
    value_digest: Option<Bytes>,
    /// Children by token
    children: BTreeMap<u8, Child>,
    /// Memoized id
    state: NodeState,
}

/// Digest of a value as committed to by its node
pub fn value_digest(value: &[u8]) -> Bytes {
    if value.len() < ID_LEN {
        Bytes::copy_from_slice(value)
    } else {
        Bytes::copy_from_slice(&sha256(value))
    }
}

/// Hash encoding shared by live nodes and proof nodes
pub(crate) fn hash_encoding<'a>(
    children: impl ExactSizeIterator<Item = (u8, &'a Key, &'a Id)>,
    value_digest: Option<&[u8]>,
    key: &Key,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + children.len() * (ID_LEN + 8));
    write_uvarint(&mut buf, children.len() as u64);
    for (token, compressed_key, id) in children {
        write_uvarint(&mut buf, u64::from(token));
        write_key(&mut buf, compressed_key);
        write_id(&mut buf, id);
    }
    write_maybe_bytes(&mut buf, value_digest);
    write_key(&mut buf, key);
    buf
}

impl Node {
    /// Create an empty dirty node at `key`
    pub fn new(key: Key) -> Self {
        Self {
            key,
            value: None,
            value_digest: None,
            children: BTreeMap::new(),
            state: NodeState::Dirty,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn value_digest(&self) -> Option<&Bytes> {
        self.value_digest.as_ref()
    }

    pub fn has_value(&self) -> bool {
        self.value_digest.is_some()
    }

    pub fn children(&self) -> &BTreeMap<u8, Child> {
        &self.children
    }

    pub fn child(&self, token: u8) -> Option<&Child> {
        self.children.get(&token)
    }

    pub fn is_dirty(&self) -> bool {
        self.state == NodeState::Dirty
    }

    /// Memoized id, if current
    pub fn id(&self) -> Option<Id> {
        match self.state {
            NodeState::Clean(id) => Some(id),
            NodeState::Dirty => None,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.state = NodeState::Dirty;
    }

    /// Replace the stored value
    pub fn set_value(&mut self, value: Option<Bytes>) {
        self.value_digest = value.as_deref().map(value_digest);
        self.value = value;
        self.mark_dirty();
    }

    /// Set only the value digest. Used when rebuilding nodes from proofs,
    /// where large values are known only by their hash.
    pub(crate) fn set_value_digest(&mut self, digest: Option<Bytes>) {
        self.value = None;
        self.value_digest = digest;
        self.mark_dirty();
    }

    /// Record `child` as a child of this node, with its current id or
    /// [`Id::EMPTY`] if it has not been hashed yet.
    ///
    /// The child's key must strictly extend this node's key by at least one
    /// token.
    pub fn add_child(&mut self, branch_factor: BranchFactor, child: &Node) {
        let id = child.id().unwrap_or(Id::EMPTY);
        self.add_child_with_id(branch_factor, &child.key, id);
    }

    /// Record a child entry for the node at `child_key`
    pub fn add_child_with_id(&mut self, branch_factor: BranchFactor, child_key: &Key, id: Id) {
        let bits = branch_factor.bits_per_token();
        let token = child_key.token(self.key.len(), bits);
        let compressed_key = child_key.skip(self.key.len() + bits);
        self.set_child(token, Child { compressed_key, id });
    }

    pub fn set_child(&mut self, token: u8, child: Child) {
        self.children.insert(token, child);
        self.mark_dirty();
    }

    /// Update the id of an existing child entry
    pub fn set_child_id(&mut self, token: u8, id: Id) {
        if let Some(child) = self.children.get_mut(&token) {
            if child.id != id {
                child.id = id;
                self.state = NodeState::Dirty;
            }
        }
    }

    pub fn remove_child(&mut self, token: u8) -> Option<Child> {
        let removed = self.children.remove(&token);
        if removed.is_some() {
            self.mark_dirty();
        }
        removed
    }

    /// Full key of the child at `token`
    pub fn child_key(&self, branch_factor: BranchFactor, token: u8) -> Option<Key> {
        self.children
            .get(&token)
            .map(|child| self.key.append_extend(branch_factor.token(token), &child.compressed_key))
    }

    /// Bytes hashed to produce the node id
    pub fn hash_encoding(&self) -> Vec<u8> {
        hash_encoding(
            self.children
                .iter()
                .map(|(token, child)| (*token, &child.compressed_key, &child.id)),
            self.value_digest.as_deref(),
            &self.key,
        )
    }

    /// Compute and memoize the node id. Children ids must already be
    /// current; calling this again without changes returns the same id.
    pub fn calculate_id(&mut self, metrics: &dyn TrieMetrics) -> Id {
        if let NodeState::Clean(id) = self.state {
            return id;
        }
        metrics.hash_calculated();
        let id = Id::from_data(&self.hash_encoding());
        trace!("Calculated id {} for node {}", id, self.key);
        self.state = NodeState::Clean(id);
        id
    }

    /// Storage encoding of the node
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_maybe_bytes(&mut buf, self.value.as_deref());
        write_uvarint(&mut buf, self.children.len() as u64);
        for (token, child) in &self.children {
            write_uvarint(&mut buf, u64::from(*token));
            write_key(&mut buf, &child.compressed_key);
            write_id(&mut buf, &child.id);
        }
        buf
    }

    /// Parse a node stored under `key`. The result is dirty: its id has to
    /// be recomputed before use.
    pub fn parse(key: Key, bytes: &[u8]) -> CodecResult<Node> {
        let mut reader = Reader::new(bytes);
        let value = reader.read_maybe_bytes()?;

        let num_children = reader.read_uvarint()?;
        if num_children > MAX_CHILDREN as u64 {
            return Err(CodecError::TooManyChildren(num_children));
        }

        let mut children = BTreeMap::new();
        let mut previous: Option<u8> = None;
        for _ in 0..num_children {
            let token = reader.read_uvarint()?;
            let token = u8::try_from(token).map_err(|_| CodecError::TokenOutOfRange(token))?;
            if previous.map_or(false, |p| token <= p) {
                return Err(CodecError::ChildrenOutOfOrder);
            }
            previous = Some(token);
            let compressed_key = reader.read_key()?;
            let id = reader.read_id()?;
            children.insert(token, Child { compressed_key, id });
        }
        reader.finish()?;

        Ok(Node {
            key,
            value_digest: value.as_deref().map(value_digest),
            value,
            children,
            state: NodeState::Dirty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::trie::metrics::{NoopMetrics, TrieCounters};

    /// Root with two hashed children under branch factor 16
    fn sample_root() -> Node {
        let bf = BranchFactor::Sixteen;
        let mut root = Node::new(Key::empty());
        for (key, value) in [(&[0xFFu8][..], &b"value1"[..]), (&[0xED][..], &b"value2"[..])] {
            let mut child = Node::new(Key::from_bytes(key));
            child.set_value(Some(Bytes::copy_from_slice(value)));
            child.calculate_id(&NoopMetrics);
            root.add_child(bf, &child);
        }
        root.set_value(Some(Bytes::from_static(b"root value")));
        root
    }

    #[test]
    fn test_value_digest() {
        assert_eq!(value_digest(b"short").as_ref(), b"short");
        let long = vec![7u8; 32];
        assert_eq!(value_digest(&long).as_ref(), &sha256(&long));
    }

    #[test]
    fn test_add_child() {
        let bf = BranchFactor::Sixteen;
        let mut root = Node::new(Key::empty());
        let child = Node::new(Key::from_bytes(b"key"));
        root.add_child(bf, &child);

        // 'k' = 0x6B: token 6, compressed key is the remaining 20 bits
        let entry = root.child(0x6).unwrap();
        assert_eq!(entry.compressed_key, Key::from_bytes(b"key").skip(4));
        assert_eq!(entry.id, Id::EMPTY);
        assert_eq!(root.child_key(bf, 0x6).unwrap(), Key::from_bytes(b"key"));
    }

    #[test]
    fn test_calculate_id_idempotent() {
        let counters = TrieCounters::new();
        let mut root = sample_root();
        let first = root.calculate_id(&counters);
        let second = root.calculate_id(&counters);
        assert_eq!(first, second);
        assert_eq!(counters.stats().hashes_calculated, 1);

        // Forcing a recompute without changes yields the same id
        root.mark_dirty();
        assert_eq!(root.calculate_id(&counters), first);
    }

    #[test]
    fn test_calculate_id_tracks_changes() {
        let mut root = sample_root();
        let before = root.calculate_id(&NoopMetrics);

        root.set_value(Some(Bytes::from_static(b"other")));
        assert!(root.is_dirty());
        let after = root.calculate_id(&NoopMetrics);
        assert_ne!(before, after);

        root.set_child_id(0xF, Id::from_data(b"changed"));
        assert!(root.is_dirty());
        assert_ne!(root.calculate_id(&NoopMetrics), after);
    }

    #[test]
    fn test_serialize_parse() {
        let root = sample_root();
        let data = root.serialize();
        let parsed = Node::parse(Key::empty(), &data).unwrap();
        assert_eq!(parsed.children(), root.children());
        assert_eq!(parsed.value(), root.value());
        assert_eq!(parsed.value_digest(), root.value_digest());

        let mut root = root;
        let mut parsed = parsed;
        assert_eq!(parsed.calculate_id(&NoopMetrics), root.calculate_id(&NoopMetrics));
    }

    #[test]
    fn test_parse_truncated() {
        let data = sample_root().serialize();
        for i in 1..data.len() {
            assert_eq!(
                Node::parse(Key::empty(), &data[..i]),
                Err(CodecError::UnexpectedEof),
                "prefix of length {}",
                i
            );
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let data = sample_root().serialize();

        let mut trailing = data.clone();
        trailing.push(0);
        assert_eq!(Node::parse(Key::empty(), &trailing), Err(CodecError::TrailingBytes(1)));

        let mut bad_bool = data.clone();
        bad_bool[0] = 2;
        assert_eq!(Node::parse(Key::empty(), &bad_bool), Err(CodecError::InvalidBool(2)));

        // value flag 0, 257 children
        let too_many = vec![0u8, 0x81, 0x02];
        assert_eq!(
            Node::parse(Key::empty(), &too_many),
            Err(CodecError::TooManyChildren(257))
        );

        // Two children with the same token
        let mut duplicated = vec![0u8, 2];
        for _ in 0..2 {
            duplicated.push(3);
            duplicated.push(0);
            duplicated.extend_from_slice(&[0u8; ID_LEN]);
        }
        assert_eq!(
            Node::parse(Key::empty(), &duplicated),
            Err(CodecError::ChildrenOutOfOrder)
        );

        // One child whose compressed key claims u64::MAX bits
        let mut huge_key = vec![0u8, 1, 0];
        huge_key.extend_from_slice(&[0xFF; 9]);
        huge_key.push(0x01);
        assert!(Node::parse(Key::empty(), &huge_key).is_err());

        // Value length far beyond the input
        let huge_value = vec![1u8, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F, 0xAA];
        assert_eq!(Node::parse(Key::empty(), &huge_value), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn test_tamper_sensitivity() {
        let mut root = sample_root();
        let original = root.calculate_id(&NoopMetrics);
        let data = root.serialize();

        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut tampered = data.clone();
                tampered[byte] ^= 1 << bit;
                if let Ok(mut parsed) = Node::parse(Key::empty(), &tampered) {
                    assert_ne!(
                        parsed.calculate_id(&NoopMetrics),
                        original,
                        "flip of bit {} in byte {} went unnoticed",
                        bit,
                        byte
                    );
                }
            }
        }
    }
}
