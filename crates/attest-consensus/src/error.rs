//! Error types for the consensus crate.

use attest_store::StoreError;

/// Errors surfaced by the consensus layer.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// Node startup failed (storage, binding, bootstrap).
    #[error("consensus startup error: {0}")]
    Startup(String),

    /// A proposal was made on a non-leader. The correct replica receives
    /// the entry via replication; callers skip silently.
    #[error("not the leader")]
    NotLeader,

    /// The proposal did not commit within the bounded timeout. The entry
    /// may still commit later; callers must treat this as "possibly
    /// committed".
    #[error("commit timed out after {0:?}")]
    CommitTimeout(std::time::Duration),

    /// Internal raft failure.
    #[error("raft error: {0}")]
    Raft(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
