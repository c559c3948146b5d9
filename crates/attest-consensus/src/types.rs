//! Raft type configuration and replicated commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use attest_store::MerkleCheckpoint;

pub type NodeId = u64;

openraft::declare_raft_types!(
    /// Raft types for the witness cluster.
    pub TypeConfig:
        D = WitnessCommand,
        R = WitnessResponse,
        NodeId = NodeId,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = std::io::Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

/// A replicated command, applied by every node's FSM in commit order.
///
/// HashChain commands carry no sequence number: each FSM derives
/// `latest(table) + 1` from its own store at apply time, which is
/// identical on every node because application order is the commit order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WitnessCommand {
    HashChain {
        table_name: String,
        record_id: String,
        data_hash: String,
        operation_type: String,
        timestamp: DateTime<Utc>,
    },
    Checkpoint {
        checkpoint: MerkleCheckpoint,
    },
}

impl WitnessCommand {
    pub fn table_name(&self) -> &str {
        match self {
            WitnessCommand::HashChain { table_name, .. } => table_name,
            WitnessCommand::Checkpoint { checkpoint } => &checkpoint.table_name,
        }
    }
}

/// FSM apply result returned to the proposer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WitnessResponse {
    /// Sequence number assigned to an applied HashChain command.
    pub sequence_num: Option<u64>,
}

/// On-disk snapshot document: the full witness state as JSON.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub hash_entries: Vec<attest_store::HashEntry>,
    #[serde(default)]
    pub merkle_checkpoints: Vec<MerkleCheckpoint>,
}
