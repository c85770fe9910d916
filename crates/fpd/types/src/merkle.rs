//! Merkle tree over public randomness values
//!
//! RFC-6962 style SHA-256 tree, the same shape the consumer chain uses to
//! verify inclusion of a randomness value in a commitment:
//!
//! ```text
//! leaf  = sha256(0x00 ∥ value)
//! inner = sha256(0x01 ∥ left ∥ right)
//! ```
//!
//! A list of `n > 1` items is split at the largest power of two strictly
//! smaller than `n`.

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const LEAF_PREFIX: u8 = 0x00;
const INNER_PREFIX: u8 = 0x01;

/// Merkle proof verification errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MerkleError {
    /// The proof describes an empty tree or an out-of-range index
    #[error("malformed proof: index {index}, total {total}")]
    Malformed {
        /// Leaf index
        index: u64,
        /// Number of leaves
        total: u64,
    },

    /// The supplied leaf does not hash to the proof's leaf hash
    #[error("leaf hash mismatch")]
    LeafMismatch,

    /// The computed root differs from the expected commitment
    #[error("root mismatch: expected {expected}, computed {computed}")]
    RootMismatch {
        /// Expected root
        expected: B256,
        /// Root recomputed from the proof
        computed: B256,
    },
}

/// Inclusion proof for one leaf
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Number of leaves in the tree
    pub total: u64,
    /// Index of the proven leaf
    pub index: u64,
    /// Hash of the proven leaf
    pub leaf_hash: B256,
    /// Sibling hashes from the leaf level up to the root
    pub aunts: Vec<B256>,
}

impl MerkleProof {
    /// Recompute the root implied by this proof
    pub fn compute_root(&self) -> Option<B256> {
        compute_from_aunts(self.index, self.total, self.leaf_hash, &self.aunts)
    }

    /// Verify that `leaf` is included under `root`
    pub fn verify(&self, root: &B256, leaf: &[u8]) -> Result<(), MerkleError> {
        if leaf_hash(leaf) != self.leaf_hash {
            return Err(MerkleError::LeafMismatch);
        }
        let computed = self
            .compute_root()
            .ok_or(MerkleError::Malformed { index: self.index, total: self.total })?;
        if computed != *root {
            return Err(MerkleError::RootMismatch { expected: *root, computed });
        }
        Ok(())
    }
}

/// Hash of a leaf
pub fn leaf_hash(leaf: &[u8]) -> B256 {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(leaf);
    B256::from_slice(&hasher.finalize())
}

/// Hash of an inner node
pub fn inner_hash(left: &B256, right: &B256) -> B256 {
    let mut hasher = Sha256::new();
    hasher.update([INNER_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    B256::from_slice(&hasher.finalize())
}

fn empty_hash() -> B256 {
    B256::from_slice(&Sha256::digest(b""))
}

/// Largest power of two strictly smaller than `n` (`n >= 2`)
const fn split_point(n: u64) -> u64 {
    let mut k = 1;
    while k << 1 < n {
        k <<= 1;
    }
    k
}

/// Root of the tree built over `items`
pub fn root_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> B256 {
    match items.len() {
        0 => empty_hash(),
        1 => leaf_hash(items[0].as_ref()),
        n => {
            let k = split_point(n as u64) as usize;
            inner_hash(&root_from_byte_slices(&items[..k]), &root_from_byte_slices(&items[k..]))
        }
    }
}

/// Root of the tree built over `items` together with one proof per item
pub fn proofs_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> (B256, Vec<MerkleProof>) {
    if items.is_empty() {
        return (empty_hash(), Vec::new());
    }

    let (root, trails) = trails_from_byte_slices(items);
    let total = items.len() as u64;
    let proofs = items
        .iter()
        .zip(trails)
        .enumerate()
        .map(|(index, (item, aunts))| MerkleProof {
            total,
            index: index as u64,
            leaf_hash: leaf_hash(item.as_ref()),
            aunts,
        })
        .collect();

    (root, proofs)
}

fn trails_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> (B256, Vec<Vec<B256>>) {
    if items.len() == 1 {
        return (leaf_hash(items[0].as_ref()), vec![Vec::new()]);
    }

    let k = split_point(items.len() as u64) as usize;
    let (left_root, mut left_trails) = trails_from_byte_slices(&items[..k]);
    let (right_root, mut right_trails) = trails_from_byte_slices(&items[k..]);

    for trail in &mut left_trails {
        trail.push(right_root);
    }
    for trail in &mut right_trails {
        trail.push(left_root);
    }
    left_trails.append(&mut right_trails);

    (inner_hash(&left_root, &right_root), left_trails)
}

fn compute_from_aunts(index: u64, total: u64, leaf: B256, aunts: &[B256]) -> Option<B256> {
    if total == 0 || index >= total {
        return None;
    }
    if total == 1 {
        return aunts.is_empty().then_some(leaf);
    }

    let (top, rest) = aunts.split_last()?;
    let k = split_point(total);
    if index < k {
        let left = compute_from_aunts(index, k, leaf, rest)?;
        Some(inner_hash(&left, top))
    } else {
        let right = compute_from_aunts(index - k, total - k, leaf, rest)?;
        Some(inner_hash(top, &right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn items(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i as u8; 32]).collect()
    }

    #[test]
    fn test_split_point() {
        assert_eq!(split_point(2), 1);
        assert_eq!(split_point(3), 2);
        assert_eq!(split_point(4), 2);
        assert_eq!(split_point(5), 4);
        assert_eq!(split_point(9), 8);
    }

    #[test]
    fn test_single_leaf_root_is_leaf_hash() {
        let items = items(1);
        let (root, proofs) = proofs_from_byte_slices(&items);
        assert_eq!(root, leaf_hash(&items[0]));
        assert!(proofs[0].aunts.is_empty());
        assert!(proofs[0].verify(&root, &items[0]).is_ok());
    }

    #[test]
    fn test_wrong_leaf_rejected() {
        let items = items(5);
        let (root, proofs) = proofs_from_byte_slices(&items);
        assert_eq!(proofs[2].verify(&root, &items[3]), Err(MerkleError::LeafMismatch));
    }

    #[test]
    fn test_wrong_root_rejected() {
        let items = items(5);
        let (_, proofs) = proofs_from_byte_slices(&items);
        let err = proofs[1].verify(&B256::repeat_byte(9), &items[1]).unwrap_err();
        assert!(matches!(err, MerkleError::RootMismatch { .. }));
    }

    #[test]
    fn test_tampered_index_rejected() {
        let items = items(4);
        let (root, proofs) = proofs_from_byte_slices(&items);
        let mut proof = proofs[0].clone();
        proof.index = 7;
        assert!(matches!(proof.verify(&root, &items[0]), Err(MerkleError::Malformed { .. })));
    }

    proptest! {
        #[test]
        fn every_proof_verifies(n in 1usize..70) {
            let items = items(n);
            let (root, proofs) = proofs_from_byte_slices(&items);
            prop_assert_eq!(root, root_from_byte_slices(&items));
            prop_assert_eq!(proofs.len(), n);
            for (item, proof) in items.iter().zip(&proofs) {
                prop_assert!(proof.verify(&root, item).is_ok());
            }
        }
    }
}
