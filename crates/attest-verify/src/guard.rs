//! Follower self-termination on divergence from the majority history.

use std::sync::Arc;

use attest_alert::{AlertManager, Severity};
use attest_consensus::FsmObserver;
use attest_store::{StoreError, WitnessStore, TERMINATED_FLAG_KEY};
use tracing::{debug, error, warn};

/// Watches consensus-applied hash entries. When the majority-agreed entry
/// disagrees with this node's local history at the same
/// `(table, sequence)`, the node is definitively divergent: raise a
/// critical alert, set the persistent termination flag, and (when enabled)
/// invoke the shutdown callback.
pub struct FollowerGuard {
    store: Arc<WitnessStore>,
    alerts: Option<Arc<AlertManager>>,
    auto_shutdown: bool,
    shutdown: Box<dyn Fn() + Send + Sync>,
}

impl FollowerGuard {
    pub fn new(
        store: Arc<WitnessStore>,
        alerts: Option<Arc<AlertManager>>,
        auto_shutdown: bool,
        shutdown: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            store,
            alerts,
            auto_shutdown,
            shutdown: Box::new(shutdown),
        }
    }
}

impl FsmObserver for FollowerGuard {
    fn on_divergence(&self, table: &str, sequence_num: u64, local_hash: &str, consensus_hash: &str) {
        error!(
            table = %table,
            seq = sequence_num,
            local_hash = %local_hash,
            consensus_hash = %consensus_hash,
            "local history diverged from consensus; the majority is authoritative"
        );

        if let Some(alerts) = &self.alerts {
            let alerts = alerts.clone();
            let table = table.to_string();
            let local = local_hash.to_string();
            let consensus = consensus_hash.to_string();
            tokio::spawn(async move {
                let message = format!(
                    "Follower diverged from the majority at {table}:{sequence_num}. \
                     Local hash: {local}. Consensus hash: {consensus}. Self-terminating."
                );
                if let Err(e) = alerts
                    .send_system_alert("Follower Inconsistency Detected", &message, Severity::Danger)
                    .await
                {
                    warn!(error = %e, "failed to deliver divergence alert");
                }
            });
        }

        if let Err(e) = self.store.set_metadata(TERMINATED_FLAG_KEY, "true") {
            error!(error = %e, "failed to set termination flag");
        }

        if self.auto_shutdown {
            warn!("auto-shutdown enabled; terminating node");
            (self.shutdown)();
        } else {
            debug!("auto-shutdown disabled; node keeps running");
        }
    }
}

/// Whether this node previously self-terminated due to divergence.
pub fn termination_flag(store: &WitnessStore) -> Result<bool, StoreError> {
    Ok(store.get_metadata(TERMINATED_FLAG_KEY)?.as_deref() == Some("true"))
}
