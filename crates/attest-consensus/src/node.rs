//! Cluster node lifecycle: startup, bootstrap, proposals, membership.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, RaftError};
use openraft::storage::Adaptor;
use openraft::{BasicNode, Config, Raft, SnapshotPolicy};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use attest_store::raft::{ConsensusLog, StableStore};
use attest_store::WitnessStore;

use crate::error::ConsensusError;
use crate::network::{raft_router, HttpNetworkFactory};
use crate::storage::{FsmObserver, RaftWitnessStore};
use crate::types::{NodeId, TypeConfig, WitnessCommand, WitnessResponse};

/// Bounded wait for a proposal to commit.
const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Static configuration for one cluster node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Address the raft RPC server binds to, and the address peers dial.
    pub bind_addr: String,
    pub data_dir: PathBuf,
    /// Exactly one node bootstraps a new cluster; it seeds the initial
    /// member list from `peers`.
    pub bootstrap: bool,
    /// Peer id → address map (excluding or including this node; the local
    /// entry is added automatically).
    pub peers: BTreeMap<NodeId, String>,
}

/// A running consensus node wrapping the witness FSM.
pub struct ConsensusNode {
    raft: Raft<TypeConfig>,
    config: NodeConfig,
    store: RaftWitnessStore,
    local_addr: SocketAddr,
    server: tokio::task::JoinHandle<()>,
    http: reqwest::Client,
}

impl ConsensusNode {
    /// Open the raft stores under `<data_dir>/raft`, start the RPC server,
    /// and (on the bootstrap node of a fresh cluster) initialize
    /// membership.
    pub async fn start(
        config: NodeConfig,
        witness: Arc<WitnessStore>,
        observer: Option<Arc<dyn FsmObserver>>,
    ) -> Result<Self, ConsensusError> {
        let raft_dir = config.data_dir.join("raft");
        std::fs::create_dir_all(&raft_dir)?;

        let log = ConsensusLog::open(raft_dir.join("raft-log.db"))?;
        let stable = StableStore::open(raft_dir.join("raft-stable.db"))?;
        let store = RaftWitnessStore::new(
            log,
            stable,
            witness,
            raft_dir.join("snapshots"),
            observer,
        )
        .map_err(|e| ConsensusError::Startup(e.to_string()))?;

        let raft_config = Config {
            cluster_name: "attest".to_string(),
            heartbeat_interval: 250,
            election_timeout_min: 1000,
            election_timeout_max: 2500,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(500),
            ..Default::default()
        }
        .validate()
        .map_err(|e| ConsensusError::Startup(e.to_string()))?;

        let (log_store, state_machine) = Adaptor::new(store.clone());
        let network = HttpNetworkFactory::new();

        let raft = Raft::new(
            config.node_id,
            Arc::new(raft_config),
            network,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| ConsensusError::Startup(e.to_string()))?;

        let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let router = raft_router(raft.clone());
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "raft rpc server exited");
            }
        });

        info!(
            node_id = config.node_id,
            addr = %local_addr,
            bootstrap = config.bootstrap,
            "consensus node started"
        );

        let node = Self {
            raft,
            config,
            store,
            local_addr,
            server,
            http: reqwest::Client::new(),
        };

        if node.config.bootstrap {
            node.bootstrap_if_fresh().await?;
        }

        Ok(node)
    }

    /// Seed the initial membership when this node has no prior state.
    async fn bootstrap_if_fresh(&self) -> Result<(), ConsensusError> {
        let initialized = self
            .raft
            .is_initialized()
            .await
            .map_err(|e| ConsensusError::Startup(e.to_string()))?;

        if initialized {
            debug!("cluster already has state; skipping bootstrap");
            return Ok(());
        }

        let mut members: BTreeMap<NodeId, BasicNode> = BTreeMap::new();
        members.insert(
            self.config.node_id,
            BasicNode::new(self.config.bind_addr.clone()),
        );
        for (id, addr) in &self.config.peers {
            members.insert(*id, BasicNode::new(addr.clone()));
        }

        info!(members = members.len(), "bootstrapping cluster");
        self.raft
            .initialize(members)
            .await
            .map_err(|e| ConsensusError::Startup(e.to_string()))?;
        Ok(())
    }

    /// Propose a command and wait (bounded) for the commit.
    ///
    /// Followers get [`ConsensusError::NotLeader`]; on
    /// [`ConsensusError::CommitTimeout`] the entry may still commit later,
    /// so callers must treat the outcome as possibly committed.
    pub async fn apply_log(&self, command: WitnessCommand) -> Result<WitnessResponse, ConsensusError> {
        match tokio::time::timeout(APPLY_TIMEOUT, self.raft.client_write(command)).await {
            Err(_) => Err(ConsensusError::CommitTimeout(APPLY_TIMEOUT)),
            Ok(Ok(response)) => Ok(response.data),
            Ok(Err(RaftError::APIError(ClientWriteError::ForwardToLeader(_)))) => {
                Err(ConsensusError::NotLeader)
            }
            Ok(Err(e)) => Err(ConsensusError::Raft(e.to_string())),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Actual bound address of the RPC server.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        self.raft.current_leader().await
    }

    pub async fn is_leader(&self) -> bool {
        self.current_leader().await == Some(self.config.node_id)
    }

    /// Block until some node is leader, up to `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId, ConsensusError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(leader) = self.current_leader().await {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                return Err(ConsensusError::Startup(format!(
                    "no leader elected within {timeout:?}"
                )));
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Current voter set from the live membership config.
    fn voter_ids(&self) -> BTreeSet<NodeId> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect()
    }

    /// Address of a member, if known.
    fn member_addr(&self, id: NodeId) -> Option<String> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .get_node(&id)
            .map(|n| n.addr.clone())
    }

    /// Add a voter: replicate it as a learner first, then promote.
    /// Leader-only; membership changes are themselves replicated entries.
    pub async fn add_voter(&self, id: NodeId, addr: String) -> Result<(), ConsensusError> {
        self.raft
            .add_learner(id, BasicNode::new(addr), true)
            .await
            .map_err(|e| ConsensusError::Raft(e.to_string()))?;

        let mut voters = self.voter_ids();
        voters.insert(id);

        self.raft
            .change_membership(voters, false)
            .await
            .map_err(|e| ConsensusError::Raft(e.to_string()))?;

        info!(added = id, "voter added");
        Ok(())
    }

    /// Remove a server from the voter set. Leader-only.
    pub async fn remove_server(&self, id: NodeId) -> Result<(), ConsensusError> {
        let mut voters = self.voter_ids();
        voters.remove(&id);

        self.raft
            .change_membership(voters, false)
            .await
            .map_err(|e| ConsensusError::Raft(e.to_string()))?;

        info!(removed = id, "server removed");
        Ok(())
    }

    /// Hand leadership to a caught-up follower by asking it to campaign;
    /// its higher term makes this node step down.
    pub async fn transfer_leadership(&self) -> Result<NodeId, ConsensusError> {
        if !self.is_leader().await {
            return Err(ConsensusError::NotLeader);
        }

        let target = self
            .voter_ids()
            .into_iter()
            .find(|id| *id != self.config.node_id)
            .ok_or_else(|| ConsensusError::Raft("no follower to transfer to".to_string()))?;

        let addr = self
            .member_addr(target)
            .ok_or_else(|| ConsensusError::Raft(format!("no address for node {target}")))?;

        self.http
            .post(format!("http://{addr}/raft/elect"))
            .send()
            .await
            .map_err(|e| ConsensusError::Raft(format!("transfer request failed: {e}")))?;

        info!(target, "leadership transfer requested");
        Ok(target)
    }

    /// The witness store behind this node's FSM.
    pub fn witness(&self) -> &Arc<WitnessStore> {
        self.store.witness()
    }

    /// Stop the raft core and the RPC server.
    pub async fn shutdown(&self) {
        if let Err(e) = self.raft.shutdown().await {
            warn!(error = %e, "raft shutdown reported an error");
        }
        self.server.abort();
        info!(node_id = self.config.node_id, "consensus node stopped");
    }
}
