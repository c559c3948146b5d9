//! Tamper classification and verification errors.

use std::fmt;

use attest_consensus::ConsensusError;
use attest_merkle::MerkleError;
use attest_store::StoreError;

/// What kind of divergence a record exhibits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TamperKind {
    /// UPDATE observed via CDC on an append-only table.
    UpdateOnAppendOnly,
    /// DELETE observed via CDC on an append-only table.
    DeleteOnAppendOnly,
    /// Row present in the live table with no witness entry.
    PhantomInsert,
    /// Witnessed row missing from the live table.
    Deleted,
    /// Row present in both with differing content hashes.
    Modified,
    /// Witness history disagrees with the majority-agreed history.
    ChainBroken,
}

impl fmt::Display for TamperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TamperKind::UpdateOnAppendOnly => "update_on_append_only",
            TamperKind::DeleteOnAppendOnly => "delete_on_append_only",
            TamperKind::PhantomInsert => "phantom_insert",
            TamperKind::Deleted => "deleted",
            TamperKind::Modified => "modified",
            TamperKind::ChainBroken => "chain_broken",
        })
    }
}

/// One offending record in a tamper report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TamperRecord {
    pub record_id: String,
    pub kind: TamperKind,
    pub expected_hash: Option<String>,
    pub actual_hash: Option<String>,
}

impl fmt::Display for TamperRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id={} ({})", self.record_id, self.kind)
    }
}

/// Errors from the handler and verifier.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Detected tampering. Never retried; enumerated per offending record.
    #[error("tampering detected on {table}: {} offending records", records.len())]
    Tamper {
        table: String,
        records: Vec<TamperRecord>,
    },

    /// Table name failed the identifier check.
    #[error("invalid table name: {0}")]
    InvalidTableName(String),

    #[error("table not configured: {0}")]
    TableNotConfigured(String),

    /// Live-table read failure.
    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Merkle(#[from] MerkleError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

impl VerifyError {
    pub fn is_tamper(&self) -> bool {
        matches!(self, VerifyError::Tamper { .. })
    }
}
