//! Record-level tree diffing.
//!
//! Root comparison is O(1) but says nothing about culprits; a full rescan
//! is O(n). Diffing the record-id → leaf-hash maps names the exact
//! offenders in O(n) map walks with O(k) output for k differing leaves.

use std::collections::BTreeMap;

use crate::builder::MerkleTreeBuilder;

/// How a record differs between the expected (witness) and actual (live)
/// trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    /// Present in both, hashes differ.
    Modified,
    /// Present in expected only: the live row was deleted.
    MissingInActual,
    /// Present in actual only: a phantom insert bypassed the witness.
    MissingInExpected,
}

/// One differing record with both sides' hashes where present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafDiff {
    pub record_id: String,
    pub kind: DiffKind,
    pub expected_hash: Option<String>,
    pub actual_hash: Option<String>,
}

/// Diff two built trees by record id. Returns an empty list when the roots
/// already match.
pub fn diff_trees(expected: &MerkleTreeBuilder, actual: &MerkleTreeBuilder) -> Vec<LeafDiff> {
    if let (Some(e), Some(a)) = (expected.root(), actual.root()) {
        if e == a && expected.leaf_count() == actual.leaf_count() {
            return Vec::new();
        }
    }

    diff_leaf_maps(expected.leaf_map(), actual.leaf_map())
}

/// Diff two record-id → leaf-hash maps.
pub fn diff_leaf_maps(
    expected: &BTreeMap<String, String>,
    actual: &BTreeMap<String, String>,
) -> Vec<LeafDiff> {
    let mut diffs = Vec::new();

    for (record_id, expected_hash) in expected {
        match actual.get(record_id) {
            None => diffs.push(LeafDiff {
                record_id: record_id.clone(),
                kind: DiffKind::MissingInActual,
                expected_hash: Some(expected_hash.clone()),
                actual_hash: None,
            }),
            Some(actual_hash) if actual_hash != expected_hash => diffs.push(LeafDiff {
                record_id: record_id.clone(),
                kind: DiffKind::Modified,
                expected_hash: Some(expected_hash.clone()),
                actual_hash: Some(actual_hash.clone()),
            }),
            Some(_) => {}
        }
    }

    for (record_id, actual_hash) in actual {
        if !expected.contains_key(record_id) {
            diffs.push(LeafDiff {
                record_id: record_id.clone(),
                kind: DiffKind::MissingInExpected,
                expected_hash: None,
                actual_hash: Some(actual_hash.clone()),
            });
        }
    }

    diffs
}
