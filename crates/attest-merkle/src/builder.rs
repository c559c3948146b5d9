//! Sorted Merkle tree construction.

use std::collections::BTreeMap;

use attest_hash::{ContentHasher, Record};
use sha2::{Digest, Sha256};

use crate::proof::MerkleProof;
use crate::MerkleError;

/// Fixed algorithm for internal-node composition.
pub const TREE_ALGORITHM: &str = "sha256";

/// Hash two child hex digests into a parent digest.
pub(crate) fn parent_hash(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

/// Builds a canonical Merkle tree over record-id-keyed leaf hashes.
///
/// Leaves may be added as raw records (hashed through the content hasher)
/// or as precomputed digests. [`MerkleTreeBuilder::build`] sorts the leaves
/// and materializes every tree level, after which the root, inclusion
/// proofs, and the internal-node map are available.
pub struct MerkleTreeBuilder {
    leaf_map: BTreeMap<String, String>,
    /// Levels bottom-up: `levels[0]` is the sorted leaf row, the last level
    /// holds the single root. Empty until built.
    levels: Vec<Vec<String>>,
}

impl Default for MerkleTreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MerkleTreeBuilder {
    pub fn new() -> Self {
        Self {
            leaf_map: BTreeMap::new(),
            levels: Vec::new(),
        }
    }

    /// Reconstruct a builder from a checkpoint's record-id → leaf-hash map.
    pub fn from_leaf_map(leaf_map: BTreeMap<String, String>) -> Self {
        Self {
            leaf_map,
            levels: Vec::new(),
        }
    }

    /// Hash a record with `hasher` and add the digest as a leaf.
    ///
    /// A second leaf for the same record id replaces the first.
    pub fn add_leaf(&mut self, record_id: &str, record: &Record, hasher: &ContentHasher) {
        let hash = hasher.hash_record(record);
        self.add_leaf_hash(record_id, hash);
    }

    /// Add a precomputed leaf digest for `record_id`.
    pub fn add_leaf_hash(&mut self, record_id: &str, hash: impl Into<String>) {
        self.leaf_map.insert(record_id.to_string(), hash.into());
        self.levels.clear();
    }

    /// Sort the leaves and materialize every level up to the root.
    pub fn build(&mut self) -> Result<(), MerkleError> {
        if self.leaf_map.is_empty() {
            return Err(MerkleError::Empty);
        }

        let mut leaves: Vec<String> = self.leaf_map.values().cloned().collect();
        leaves.sort();

        let mut levels = vec![leaves];

        while levels.last().map(Vec::len).unwrap_or(0) > 1 {
            let current = levels.last().expect("levels is non-empty");
            let mut next = Vec::with_capacity(current.len().div_ceil(2));

            for pair in current.chunks(2) {
                let left = &pair[0];
                // Odd node at the end pairs with itself.
                let right = pair.get(1).unwrap_or(left);
                next.push(parent_hash(left, right));
            }

            levels.push(next);
        }

        self.levels = levels;
        Ok(())
    }

    /// The root digest, once built.
    pub fn root(&self) -> Option<&str> {
        self.levels
            .last()
            .and_then(|level| level.first())
            .map(String::as_str)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_map.len()
    }

    /// Record-id → leaf-hash map, as persisted in checkpoints.
    pub fn leaf_map(&self) -> &BTreeMap<String, String> {
        &self.leaf_map
    }

    /// Whether a leaf exists for `record_id`.
    pub fn contains(&self, record_id: &str) -> bool {
        self.leaf_map.contains_key(record_id)
    }

    /// Leaf hash for `record_id`, if present.
    pub fn leaf_hash(&self, record_id: &str) -> Option<&str> {
        self.leaf_map.get(record_id).map(String::as_str)
    }

    /// All internal nodes keyed `level:index` (level 1 is just above the
    /// leaves). Empty before build or for single-leaf trees.
    pub fn internal_nodes(&self) -> BTreeMap<String, String> {
        let mut nodes = BTreeMap::new();

        for (level, hashes) in self.levels.iter().enumerate().skip(1) {
            for (index, hash) in hashes.iter().enumerate() {
                nodes.insert(format!("{level}:{index}"), hash.clone());
            }
        }

        nodes
    }

    /// Generate an inclusion proof for `record_id`.
    pub fn proof(&self, record_id: &str) -> Result<MerkleProof, MerkleError> {
        let leaf_hash = self
            .leaf_map
            .get(record_id)
            .ok_or_else(|| MerkleError::RecordNotFound(record_id.to_string()))?;

        let leaves = self.levels.first().ok_or(MerkleError::NotBuilt)?;

        let mut index = leaves
            .iter()
            .position(|h| h == leaf_hash)
            .ok_or(MerkleError::NotBuilt)?;
        let leaf_index = index;

        let mut siblings = Vec::new();
        let mut left = Vec::new();

        // Walk each level below the root, recording the sibling and which
        // side the running hash sits on.
        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let is_left = index % 2 == 0;
            let sibling_index = if is_left {
                // Odd tail duplicates itself.
                (index + 1).min(level.len() - 1)
            } else {
                index - 1
            };

            siblings.push(level[sibling_index].clone());
            left.push(is_left);
            index /= 2;
        }

        Ok(MerkleProof {
            leaf_hash: leaf_hash.clone(),
            leaf_index,
            siblings,
            left,
        })
    }
}

pub(crate) use parent_hash as combine;
