//! Detection components: the witness handler, the Merkle verifier, and
//! the follower guard.
//!
//! The handler turns CDC events into witness entries (through consensus
//! when clustered). The verifier periodically proves the live table equals
//! the content implied by the witness log, attributing any discrepancy to
//! modified, deleted, or phantom-inserted records. The guard watches
//! consensus-applied entries for disagreement with local history and
//! self-terminates the node when the majority says it diverged.

mod error;
mod guard;
mod handler;
mod verifier;

pub use error::{TamperKind, TamperRecord, VerifyError};
pub use guard::{termination_flag, FollowerGuard};
pub use handler::{TableConfig, WitnessHandler};
pub use verifier::{LiveTableSource, MerkleVerifier, PgLiveTable, VerifyReport};

#[cfg(test)]
mod tests;
