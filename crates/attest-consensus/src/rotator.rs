//! Periodic leadership rotation.
//!
//! Verifies that followers can take over by handing leadership off on an
//! interval. Idempotent: non-leaders no-op each tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::node::ConsensusNode;

pub struct LeadershipRotator {
    node: Arc<ConsensusNode>,
    interval: Duration,
}

impl LeadershipRotator {
    pub fn new(node: Arc<ConsensusNode>, interval: Duration) -> Self {
        Self { node, interval }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "leadership rotator started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so rotation starts one
        // full interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("leadership rotator stopped");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if !self.node.is_leader().await {
                        debug!("not the leader; skipping rotation");
                        continue;
                    }

                    match self.node.transfer_leadership().await {
                        Ok(target) => {
                            info!(old_leader = self.node.node_id(), new_leader = target,
                                "leadership transferred");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                        Err(e) => error!(error = %e, "leadership transfer failed"),
                    }
                }
            }
        }
    }
}
