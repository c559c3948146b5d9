//! Canonical Merkle trees over per-record content hashes.
//!
//! Leaves are hex digests keyed by record id. Before building, leaves are
//! sorted lexicographically so the root is independent of insertion order;
//! odd nodes at any level are paired with themselves. Internal nodes always
//! hash with SHA-256 over the concatenated child hex strings, regardless of
//! the content algorithm; the tree algorithm is recorded in checkpoints so
//! a store stays consistent with itself forever.

mod builder;
mod diff;
mod proof;

pub use builder::{MerkleTreeBuilder, TREE_ALGORITHM};
pub use diff::{diff_leaf_maps, diff_trees, DiffKind, LeafDiff};
pub use proof::MerkleProof;

/// Errors from tree construction and proof generation.
#[derive(Debug, thiserror::Error)]
pub enum MerkleError {
    /// Build was called with no leaves.
    #[error("no leaves to build tree")]
    Empty,

    /// The tree has not been built yet.
    #[error("tree not built")]
    NotBuilt,

    /// No leaf exists for the requested record id.
    #[error("record not found in tree: {0}")]
    RecordNotFound(String),
}

#[cfg(test)]
mod tests;
