//! Durable embedded storage for the witness pipeline.
//!
//! [`WitnessStore`] owns the append-only hash entries, Merkle checkpoints,
//! and operational metadata. [`raft`] holds the replicated-log and
//! stable-state primitives the consensus layer builds on. Everything is
//! backed by fjall keyspaces; every write commits before returning, so the
//! latest committed state is visible after a crash.

mod entry;
mod error;
pub mod raft;
mod store;

pub use entry::{HashEntry, MerkleCheckpoint};
pub use error::StoreError;
pub use store::WitnessStore;

/// Metadata key set when a follower self-terminates after diverging from
/// the majority-agreed history.
pub const TERMINATED_FLAG_KEY: &str = "follower_terminated_due_to_inconsistency";
