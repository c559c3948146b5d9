//! The witness handler: CDC events in, witness entries out.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use attest_alert::AlertManager;
use attest_cdc::{ChangeEvent, EventHandler, HandlerError, Operation};
use attest_consensus::{ConsensusError, ConsensusNode, WitnessCommand};
use attest_hash::ContentHasher;
use attest_store::{HashEntry, WitnessStore};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::VerifyError;

/// One protected table and its verification cadence.
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub name: String,
    pub verify_interval: Option<Duration>,
}

fn table_name_regex() -> Regex {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex")
}

/// Reject names that cannot be safely used as SQL identifiers.
pub(crate) fn validate_table_name(name: &str) -> Result<(), VerifyError> {
    if table_name_regex().is_match(name) {
        Ok(())
    } else {
        Err(VerifyError::InvalidTableName(name.to_string()))
    }
}

/// Turns change events on protected tables into witness entries.
///
/// Protected tables are declared append-only: UPDATE and DELETE events are
/// themselves evidence of tamper (or operator error) and are rejected
/// without writing anything. INSERTs are hashed and proposed through
/// consensus when clustered, or written directly in single-node mode.
pub struct WitnessHandler {
    store: Arc<WitnessStore>,
    hasher: Arc<ContentHasher>,
    /// Read-mostly: populated at startup, consulted per event.
    tables: RwLock<HashMap<String, TableConfig>>,
    consensus: Option<Arc<ConsensusNode>>,
    alerts: Option<Arc<AlertManager>>,
}

impl WitnessHandler {
    pub fn new(store: Arc<WitnessStore>, hasher: Arc<ContentHasher>) -> Self {
        Self {
            store,
            hasher,
            tables: RwLock::new(HashMap::new()),
            consensus: None,
            alerts: None,
        }
    }

    /// Route witness writes through the consensus layer.
    pub fn with_consensus(mut self, consensus: Arc<ConsensusNode>) -> Self {
        self.consensus = Some(consensus);
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Register a protected table. The name must be a valid identifier.
    pub fn add_table(&self, config: TableConfig) -> Result<(), VerifyError> {
        validate_table_name(&config.name)?;
        info!(table = %config.name, "protecting table");
        self.tables
            .write()
            .unwrap()
            .insert(config.name.clone(), config);
        Ok(())
    }

    pub fn is_protected(&self, table_name: &str) -> bool {
        self.tables.read().unwrap().contains_key(table_name)
    }

    pub fn protected_tables(&self) -> Vec<TableConfig> {
        self.tables.read().unwrap().values().cloned().collect()
    }

    async fn alert_tamper(&self, event: &ChangeEvent) {
        if let Some(alerts) = &self.alerts {
            let details = format!(
                "{} observed on append-only table {}",
                event.operation, event.table_name
            );
            if let Err(e) = alerts
                .send_tamper_alert(
                    &event.table_name,
                    &event.operation.to_string(),
                    &event.record_id(),
                    &details,
                )
                .await
            {
                warn!(error = %e, "failed to deliver tamper alert");
            }
        }
    }

    async fn witness_insert(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        let data_hash = self.hasher.hash_record(&event.new_data);
        let record_id = event.record_id();

        match &self.consensus {
            Some(consensus) => {
                let command = WitnessCommand::HashChain {
                    table_name: event.table_name.clone(),
                    record_id,
                    data_hash,
                    operation_type: event.operation.to_string(),
                    timestamp: event.timestamp,
                };

                match consensus.apply_log(command).await {
                    Ok(response) => {
                        debug!(
                            table = %event.table_name,
                            seq = response.sequence_num,
                            "witness entry replicated"
                        );
                        Ok(())
                    }
                    // A follower's entry arrives via replication.
                    Err(ConsensusError::NotLeader) => {
                        debug!(
                            table = %event.table_name,
                            "not the leader; entry will arrive via replication"
                        );
                        Ok(())
                    }
                    // Possibly committed: do not advance the position; the
                    // redelivered duplicate is absorbed by the FSM.
                    Err(e @ ConsensusError::CommitTimeout(_)) => {
                        warn!(table = %event.table_name, error = %e, "commit outcome unknown");
                        Err(HandlerError::Other(e.to_string()))
                    }
                    Err(e) => Err(HandlerError::Other(e.to_string())),
                }
            }
            None => {
                let sequence_num = self
                    .store
                    .latest_hash_entry(&event.table_name)
                    .map_err(|e| HandlerError::Other(e.to_string()))?
                    .map_or(1, |e| e.sequence_num + 1);

                let entry = HashEntry {
                    table_name: event.table_name.clone(),
                    sequence_num,
                    record_id,
                    data_hash,
                    operation_type: event.operation.to_string(),
                    timestamp: event.timestamp,
                };

                self.store
                    .save_hash_entry(&entry)
                    .map_err(|e| HandlerError::Other(e.to_string()))?;

                debug!(table = %event.table_name, seq = sequence_num, "witness entry stored");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EventHandler for WitnessHandler {
    async fn handle_change(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        if !self.is_protected(&event.table_name) {
            return Ok(());
        }

        match event.operation {
            Operation::Update | Operation::Delete => {
                self.alert_tamper(event).await;
                Err(HandlerError::Tamper {
                    table: event.table_name.clone(),
                    operation: event.operation.to_string(),
                })
            }
            Operation::Insert => self.witness_insert(event).await,
        }
    }
}
