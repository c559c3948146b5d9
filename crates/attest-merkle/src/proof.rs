//! Inclusion proofs.

use crate::builder::combine;

/// An inclusion proof: the leaf digest, its index in the sorted leaf row,
/// and one sibling per level with the side the running hash takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf_hash: String,
    pub leaf_index: usize,
    pub siblings: Vec<String>,
    /// `left[i]` is true when the running hash is the left operand at
    /// level `i`.
    pub left: Vec<bool>,
}

impl MerkleProof {
    /// Replay the proof and compare the result against `expected_root`.
    pub fn verify(&self, expected_root: &str) -> bool {
        let mut current = self.leaf_hash.clone();

        for (sibling, is_left) in self.siblings.iter().zip(&self.left) {
            current = if *is_left {
                combine(&current, sibling)
            } else {
                combine(sibling, &current)
            };
        }

        current == expected_root
    }
}
