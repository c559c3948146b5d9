//! Persisted record types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One witness record per observed INSERT on a protected table.
///
/// `sequence_num` values for a table are the gap-free positive integers
/// 1..N; entries are never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashEntry {
    pub table_name: String,
    pub sequence_num: u64,
    /// Canonical primary-key projection, rendered once at observation time.
    pub record_id: String,
    /// Digest of the normalized record under the configured content hasher.
    pub data_hash: String,
    pub operation_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Periodic snapshot of a table's witness Merkle tree.
///
/// `leaf_map` and `internal_nodes` let the verifier rebuild the tree from
/// the checkpoint plus only the entries above `sequence_num`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerkleCheckpoint {
    pub table_name: String,
    /// Highest witness sequence included in the checkpoint.
    pub sequence_num: u64,
    pub merkle_root: String,
    pub record_count: u64,
    pub timestamp: DateTime<Utc>,
    /// Content-hash algorithm in effect when the checkpoint was taken.
    pub hash_algorithm: String,
    /// Internal-node algorithm, fixed per store.
    #[serde(default = "default_tree_algorithm")]
    pub tree_algorithm: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub leaf_map: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub internal_nodes: BTreeMap<String, String>,
}

fn default_tree_algorithm() -> String {
    "sha256".to_string()
}
