use std::collections::BTreeMap;

use bytes::Bytes;
use proptest::prelude::*;

use merkledb::storage::trie::{BranchFactor, Key, MerkleTrie, ProofIterator};

fn branch_factor() -> impl Strategy<Value = BranchFactor> {
    prop::sample::select(BranchFactor::ALL.to_vec())
}

/// A key of arbitrary bit length, possibly ending mid-byte
fn any_key() -> impl Strategy<Value = Key> {
    (prop::collection::vec(any::<u8>(), 0..8), any::<usize>()).prop_map(|(bytes, cut)| {
        let bits = if bytes.is_empty() { 0 } else { cut % (bytes.len() * 8 + 1) };
        Key::from_bytes(&bytes).take(bits)
    })
}

/// Insert and delete operations over a small key space, so deletes hit
/// existing keys and keys share prefixes
fn operations() -> impl Strategy<Value = Vec<(Vec<u8>, Option<Vec<u8>>)>> {
    let key = prop::collection::vec(0u8..4, 0..4);
    let value = prop::option::weighted(0.75, prop::collection::vec(any::<u8>(), 0..40));
    prop::collection::vec((key, value), 1..40)
}

fn apply(trie: &mut MerkleTrie, ops: &[(Vec<u8>, Option<Vec<u8>>)]) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut model = BTreeMap::new();
    for (key, value) in ops {
        match value {
            Some(value) => {
                trie.insert(Key::from_bytes(key), Bytes::copy_from_slice(value));
                model.insert(key.clone(), value.clone());
            }
            None => {
                trie.remove(&Key::from_bytes(key));
                model.remove(key);
            }
        }
    }
    model
}

proptest! {
    #[test]
    fn key_bytes_round_trip(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let key = Key::from_bytes(&bytes);
        prop_assert_eq!(key.as_bytes(), &bytes[..]);
        prop_assert_eq!(key.len(), bytes.len() * 8);
    }

    #[test]
    fn take_and_skip_boundaries(key in any_key()) {
        prop_assert_eq!(key.take(key.len()), key.clone());
        prop_assert_eq!(key.skip(0), key.clone());
        prop_assert!(key.has_prefix(&key));
        prop_assert!(!key.has_strict_prefix(&key));
    }

    #[test]
    fn take_and_skip_lengths(key in any_key(), n in 0usize..80) {
        prop_assert_eq!(key.skip(n).len(), key.len().saturating_sub(n));
        prop_assert_eq!(key.take(n).len(), n.min(key.len()));
        prop_assert!(key.has_prefix(&key.take(n)));
    }

    #[test]
    fn append_extends_prefix(key in any_key(), bf in branch_factor(), token in any::<u8>()) {
        let token = bf.token((token as usize % bf.num_children()) as u8);
        let extended = key.append(token);
        prop_assert_eq!(extended.len(), key.len() + bf.bits_per_token());
        prop_assert!(extended.has_prefix(&key));
        prop_assert!(extended.has_strict_prefix(&key));
    }

    #[test]
    fn proofs_verify_after_any_updates(bf in branch_factor(), ops in operations()) {
        let mut trie = MerkleTrie::standalone(bf);
        let model = apply(&mut trie, &ops);
        let root = trie.compute_root();

        for (key, value) in &model {
            let proof = trie.get_proof(&Key::from_bytes(key)).unwrap();
            prop_assert_eq!(proof.value.as_deref(), Some(&value[..]));
            prop_assert!(proof.verify(&root, bf).is_ok());
        }
        // Deleted and never-inserted keys get valid exclusion proofs
        for (key, _) in &ops {
            if !model.contains_key(key) {
                let proof = trie.get_proof(&Key::from_bytes(key)).unwrap();
                prop_assert!(proof.value.is_none());
                prop_assert!(proof.verify(&root, bf).is_ok());
            }
        }
    }

    #[test]
    fn root_depends_only_on_contents(bf in branch_factor(), ops in operations()) {
        let mut trie = MerkleTrie::standalone(bf);
        let model = apply(&mut trie, &ops);

        let mut rebuilt = MerkleTrie::standalone(bf);
        for (key, value) in model.iter().rev() {
            rebuilt.insert(Key::from_bytes(key), Bytes::copy_from_slice(value));
        }
        prop_assert_eq!(trie.compute_root(), rebuilt.compute_root());
    }

    #[test]
    fn proof_iterator_is_ordered(bf in branch_factor(), ops in operations()) {
        let mut trie = MerkleTrie::standalone(bf);
        let model = apply(&mut trie, &ops);
        trie.compute_root();
        prop_assume!(!model.is_empty());

        for key in model.keys() {
            let proof = trie.get_proof(&Key::from_bytes(key)).unwrap();
            let keys: Vec<Key> = ProofIterator::new(&proof.path, &Key::empty(), bf)
                .unwrap()
                .map(|(k, _)| k)
                .collect();
            prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));
            for node in &proof.path {
                prop_assert!(keys.contains(&node.key));
            }
        }

        // For the largest key the walk ends on the last proof node
        let largest = model.keys().next_back().map(|k| Key::from_bytes(k)).unwrap();
        let proof = trie.get_proof(&largest).unwrap();
        let last = ProofIterator::new(&proof.path, &Key::empty(), bf).unwrap().last().unwrap();
        prop_assert_eq!(Some(&last.0), proof.path.last().map(|node| &node.key));
    }

    #[test]
    fn proof_iterator_respects_start(bf in branch_factor(), ops in operations(), start in any_key()) {
        let mut trie = MerkleTrie::standalone(bf);
        apply(&mut trie, &ops);
        trie.compute_root();

        let proof = trie.get_proof(&start.take(start.len() - start.len() % bf.bits_per_token())).unwrap();
        let all: Vec<Key> = ProofIterator::new(&proof.path, &Key::empty(), bf).unwrap().map(|(k, _)| k).collect();
        let from_start: Vec<Key> = ProofIterator::new(&proof.path, &start, bf).unwrap().map(|(k, _)| k).collect();
        let expected: Vec<Key> = all.into_iter().filter(|k| *k >= start).collect();
        prop_assert_eq!(from_start, expected);
    }
}

#[test]
fn root_returns_after_delete() {
    let mut trie = MerkleTrie::standalone(BranchFactor::Sixteen);
    let empty = trie.compute_root();

    trie.insert(Key::from_bytes(&[0x12]), Bytes::from_static(b"a"));
    let one = trie.compute_root();
    trie.insert(Key::from_bytes(&[0x13]), Bytes::from_static(b"b"));
    let two = trie.compute_root();
    trie.insert(Key::from_bytes(&[0x1F]), Bytes::from_static(b"c"));
    let three = trie.compute_root();

    assert_ne!(empty, one);
    assert_ne!(one, two);
    assert_ne!(two, three);

    trie.remove(&Key::from_bytes(&[0x1F]));
    assert_eq!(trie.compute_root(), two);
}

#[test]
fn take_half_byte() {
    let key = Key::from_bytes(&[0b1010_0000]).take(4);
    assert_eq!(key.len(), 4);
    assert_eq!(key.token(0, 4), 0b1010);
}
