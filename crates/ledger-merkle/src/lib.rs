//! Merkle root construction and inclusion proofs over event hashes.
//!
//! The tree here is purely a function of a decision's ordered event hashes —
//! it knows nothing about `Decision` or `EventRecord` shapes. A snapshot's
//! `root_hash` is the root over event hashes `1..=up_to_seq`; a Merkle proof
//! lets a verifier check that a single event hash was included in that root
//! without re-fetching every event.
//!
//! Leaf and internal node hashes are domain-separated by a string prefix
//! (`"leaf:"` / `"node:"`) over hex-encoded hashes, not by a null-byte
//! domain-separated binary hash — this is the convention the writer and
//! verifier must agree on bit-for-bit, so it is spelled out here rather than
//! left to a generic hashing helper.

use ledger_enc::sha256_hex;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum MerkleError {
    #[error("cannot compute a root over zero leaves")]
    EmptyTree,
    #[error("leaf index {index} out of bounds for tree of size {len}")]
    IndexOutOfBounds { index: usize, len: usize },
}

/// Lowercase hex SHA-256, same representation events/anchors/receipts use.
pub type Hash = String;

fn leaf_hash(event_hash: &str) -> Hash {
    sha256_hex(format!("leaf:{event_hash}").as_bytes())
}

fn node_hash(left: &str, right: &str) -> Hash {
    sha256_hex(format!("node:{left}:{right}").as_bytes())
}

/// Inclusion proof for one leaf against a frozen tree's root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub leaf_hash: Hash,
    /// Siblings from leaf to root; `true` means the sibling is the right
    /// operand of the pairing (this node is on the left).
    pub siblings: Vec<(Hash, bool)>,
}

impl MerkleProof {
    /// Replay the hash chain bottom-up and compare to `root`.
    pub fn verify(&self, root: &str) -> bool {
        let mut current = self.leaf_hash.clone();
        for (sibling, sibling_is_right) in &self.siblings {
            current = if *sibling_is_right {
                node_hash(&current, sibling)
            } else {
                node_hash(sibling, &current)
            };
        }
        current == root
    }
}

/// Binary Merkle tree over a frozen ordered list of event hashes.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// Level 0 is leaf hashes (already `"leaf:"`-prefixed), last level is
    /// the single root.
    levels: Vec<Vec<Hash>>,
    /// Number of real (pre-padding) leaves.
    leaf_count: usize,
}

impl MerkleTree {
    /// Build a tree over `event_hashes`, in seq order, hex-encoded.
    pub fn new(event_hashes: Vec<String>) -> Result<Self, MerkleError> {
        if event_hashes.is_empty() {
            return Err(MerkleError::EmptyTree);
        }
        let leaf_count = event_hashes.len();
        let mut level: Vec<Hash> = event_hashes.iter().map(|h| leaf_hash(h)).collect();
        if level.len() % 2 == 1 {
            level.push(level.last().unwrap().clone());
        }
        let mut levels = vec![level.clone()];
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                next.push(node_hash(left, right));
            }
            if next.len() % 2 == 1 && next.len() > 1 {
                next.push(next.last().unwrap().clone());
            }
            levels.push(next.clone());
            level = next;
        }
        Ok(Self { levels, leaf_count })
    }

    pub fn root(&self) -> Result<Hash, MerkleError> {
        self.levels
            .last()
            .and_then(|level| level.first())
            .cloned()
            .ok_or(MerkleError::EmptyTree)
    }

    /// Number of real (non-padding) leaves this tree was built from.
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Build the inclusion proof for the leaf at `leaf_index`.
    pub fn proof(&self, leaf_index: usize) -> Result<MerkleProof, MerkleError> {
        if leaf_index >= self.leaf_count {
            return Err(MerkleError::IndexOutOfBounds {
                index: leaf_index,
                len: self.leaf_count,
            });
        }
        let leaf_hash = self.levels[0][leaf_index].clone();
        let mut siblings = Vec::new();
        let mut index = leaf_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = if index % 2 == 0 { index + 1 } else { index - 1 };
            if let Some(sibling) = level.get(sibling_index) {
                // Even index means we're the left operand, so the sibling
                // sits on the right.
                siblings.push((sibling.clone(), index % 2 == 0));
            }
            index /= 2;
        }
        Ok(MerkleProof {
            leaf_index,
            leaf_hash,
            siblings,
        })
    }
}

/// Build the root over `event_hashes` without materializing a `MerkleTree`.
pub fn merkle_root(event_hashes: Vec<String>) -> Result<Hash, MerkleError> {
    MerkleTree::new(event_hashes)?.root()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hashes(n: usize) -> Vec<String> {
        (0..n).map(|i| sha256_hex(format!("event-{i}").as_bytes())).collect()
    }

    #[test]
    fn single_leaf_is_duplicated_and_proof_verifies() {
        let tree = MerkleTree::new(hashes(1)).unwrap();
        assert_eq!(tree.leaf_count(), 1);
        let root = tree.root().unwrap();
        let proof = tree.proof(0).unwrap();
        assert!(proof.verify(&root));
    }

    #[test]
    fn even_leaves_all_proofs_verify() {
        let tree = MerkleTree::new(hashes(4)).unwrap();
        let root = tree.root().unwrap();
        for i in 0..4 {
            assert!(tree.proof(i).unwrap().verify(&root), "leaf {i}");
        }
    }

    #[test]
    fn odd_leaves_all_proofs_verify() {
        let tree = MerkleTree::new(hashes(5)).unwrap();
        let root = tree.root().unwrap();
        for i in 0..5 {
            assert!(tree.proof(i).unwrap().verify(&root), "leaf {i}");
        }
    }

    #[test]
    fn flipping_a_sibling_breaks_verification() {
        let tree = MerkleTree::new(hashes(4)).unwrap();
        let root = tree.root().unwrap();
        let mut proof = tree.proof(1).unwrap();
        proof.siblings[0].0 = sha256_hex(b"tampered");
        assert!(!proof.verify(&root));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(MerkleTree::new(vec![]), Err(MerkleError::EmptyTree)));
    }

    #[test]
    fn out_of_bounds_proof_is_rejected() {
        let tree = MerkleTree::new(hashes(2)).unwrap();
        assert!(matches!(
            tree.proof(5),
            Err(MerkleError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn leaf_and_node_domains_do_not_collide() {
        let h = sha256_hex(b"x");
        assert_ne!(leaf_hash(&h), node_hash(&h, &h));
    }

    proptest! {
        #[test]
        fn all_proofs_verify_for_arbitrary_size(n in 1usize..64) {
            let tree = MerkleTree::new(hashes(n)).unwrap();
            let root = tree.root().unwrap();
            for i in 0..n {
                prop_assert!(tree.proof(i).unwrap().verify(&root));
            }
        }

        #[test]
        fn different_event_hashes_give_different_roots(n in 2usize..32) {
            let a = merkle_root(hashes(n)).unwrap();
            let mut other = hashes(n);
            other[0] = sha256_hex(b"different");
            let b = merkle_root(other).unwrap();
            prop_assert_ne!(a, b);
        }
    }
}
