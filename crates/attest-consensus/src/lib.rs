//! Replicated state machine around the witness store.
//!
//! A leader-based replicated log (openraft) makes the witness history
//! linearizable across the cluster: the leader proposes HashChain and
//! Checkpoint commands, a majority commit makes them durable, and every
//! node's FSM applies them to its local [`attest_store::WitnessStore`] in
//! commit order. Sequence numbers are allocated inside the FSM from the
//! local store's latest entry, so allocation is deterministic and
//! duplicate deliveries are absorbed.

mod error;
mod network;
mod node;
mod rotator;
mod storage;
mod types;

pub use error::ConsensusError;
pub use network::{raft_router, HttpNetworkFactory};
pub use node::{ConsensusNode, NodeConfig};
pub use rotator::LeadershipRotator;
pub use storage::{FsmObserver, RaftWitnessStore};
pub use types::{NodeId, TypeConfig, WitnessCommand, WitnessResponse};
