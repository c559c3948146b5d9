//! Periodic reconciliation between live tables and the witness log.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use attest_alert::AlertManager;
use attest_cdc::Row;
use attest_consensus::{ConsensusError, ConsensusNode, WitnessCommand};
use attest_hash::{ContentHasher, FieldValue};
use attest_merkle::{diff_leaf_maps, DiffKind, MerkleTreeBuilder, TREE_ALGORITHM};
use attest_store::{MerkleCheckpoint, WitnessStore};
use chrono::Utc;
use tokio::sync::watch;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::{debug, error, info, warn};

use crate::error::{TamperKind, TamperRecord, VerifyError};
use crate::handler::{validate_table_name, TableConfig};

/// Fallback cadence for tables configured without an interval.
const DEFAULT_VERIFY_INTERVAL: Duration = Duration::from_secs(300);

/// Reads the current contents of a protected table.
///
/// Values must be in their text form, the same type-output
/// representation the replication stream delivers, so both paths hash
/// identically.
#[async_trait]
pub trait LiveTableSource: Send + Sync {
    /// All rows of `table`, in primary-key order.
    async fn fetch_rows(&self, table: &str) -> Result<Vec<Row>, VerifyError>;
}

/// Production source: a read-only simple-query scan.
pub struct PgLiveTable {
    connection_string: String,
}

impl PgLiveTable {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }
}

#[async_trait]
impl LiveTableSource for PgLiveTable {
    async fn fetch_rows(&self, table: &str) -> Result<Vec<Row>, VerifyError> {
        validate_table_name(table)?;

        let (client, connection) = tokio_postgres::connect(&self.connection_string, NoTls)
            .await
            .map_err(|e| VerifyError::Database(e.to_string()))?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "verification connection closed");
            }
        });

        // The name is validated above and quoted as an identifier; no
        // untrusted interpolation.
        let query = format!("SELECT * FROM \"{table}\" ORDER BY id");
        let messages = client
            .simple_query(&query)
            .await
            .map_err(|e| VerifyError::Database(e.to_string()))?;

        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let mut record = Row::new();
                for (i, column) in row.columns().iter().enumerate() {
                    let value = match row.get(i) {
                        Some(text) => FieldValue::Text(text.to_string()),
                        None => FieldValue::Null,
                    };
                    record.insert(column.name().to_string(), value);
                }
                rows.push(record);
            }
        }

        driver.abort();
        Ok(rows)
    }
}

/// Outcome of a clean verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub table: String,
    pub merkle_root: String,
    pub record_count: u64,
}

/// Rebuilds the live and witness Merkle trees for each protected table and
/// classifies any divergence.
pub struct MerkleVerifier {
    store: Arc<WitnessStore>,
    hasher: Arc<ContentHasher>,
    live: Arc<dyn LiveTableSource>,
    tables: Vec<TableConfig>,
    consensus: Option<Arc<ConsensusNode>>,
    alerts: Option<Arc<AlertManager>>,
}

impl MerkleVerifier {
    pub fn new(
        store: Arc<WitnessStore>,
        hasher: Arc<ContentHasher>,
        live: Arc<dyn LiveTableSource>,
    ) -> Self {
        Self {
            store,
            hasher,
            live,
            tables: Vec::new(),
            consensus: None,
            alerts: None,
        }
    }

    pub fn with_consensus(mut self, consensus: Arc<ConsensusNode>) -> Self {
        self.consensus = Some(consensus);
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn add_table(&mut self, config: TableConfig) -> Result<(), VerifyError> {
        validate_table_name(&config.name)?;
        self.tables.push(config);
        Ok(())
    }

    /// Verify one table: build both trees, compare, classify.
    pub async fn verify_table(&self, table: &str) -> Result<VerifyReport, VerifyError> {
        validate_table_name(table)?;

        // Actual tree from the live table.
        let rows = self.live.fetch_rows(table).await?;
        let mut actual = MerkleTreeBuilder::new();
        for row in &rows {
            let record_id = row
                .get("id")
                .map(FieldValue::canonical_string)
                .unwrap_or_default();
            actual.add_leaf(&record_id, row, &self.hasher);
        }
        if actual.leaf_count() > 0 {
            actual.build()?;
        }

        // Expected tree from the witness log, bounded by the checkpoint.
        let expected_map = self.expected_leaf_map(table)?;
        let mut expected = MerkleTreeBuilder::from_leaf_map(expected_map);
        if expected.leaf_count() > 0 {
            expected.build()?;
        }

        let roots_match = expected.root() == actual.root()
            && expected.leaf_count() == actual.leaf_count();

        if roots_match {
            let report = VerifyReport {
                table: table.to_string(),
                merkle_root: actual.root().unwrap_or_default().to_string(),
                record_count: actual.leaf_count() as u64,
            };
            self.persist_checkpoint(table, &actual).await?;
            debug!(table = %table, root = %report.merkle_root, "merkle roots match");
            return Ok(report);
        }

        // Detailed path: name the offenders.
        let records = classify(expected.leaf_map(), actual.leaf_map());
        warn!(
            table = %table,
            offenders = records.len(),
            expected_records = expected.leaf_count(),
            actual_records = actual.leaf_count(),
            "merkle root mismatch"
        );

        if let Some(alerts) = &self.alerts {
            for record in &records {
                let details = format!(
                    "expected hash {}, actual hash {}",
                    record.expected_hash.as_deref().unwrap_or("<none>"),
                    record.actual_hash.as_deref().unwrap_or("<none>"),
                );
                if let Err(e) = alerts
                    .send_tamper_alert(table, &record.kind.to_string(), &record.record_id, &details)
                    .await
                {
                    warn!(error = %e, "failed to deliver tamper alert");
                }
            }
        }

        Err(VerifyError::Tamper {
            table: table.to_string(),
            records,
        })
    }

    /// Leaf map implied by the witness log: the latest checkpoint's map
    /// plus every entry above its sequence, or a full scan when no
    /// checkpoint exists.
    fn expected_leaf_map(&self, table: &str) -> Result<BTreeMap<String, String>, VerifyError> {
        match self.store.latest_merkle_checkpoint(table)? {
            Some(checkpoint) if !checkpoint.leaf_map.is_empty() => {
                let mut map = checkpoint.leaf_map.clone();
                let mut applied = 0usize;
                for entry in self.store.all_hash_entries(table)? {
                    if entry.sequence_num > checkpoint.sequence_num {
                        map.insert(entry.record_id, entry.data_hash);
                        applied += 1;
                    }
                }
                debug!(
                    table = %table,
                    checkpoint_seq = checkpoint.sequence_num,
                    new_entries = applied,
                    "rebuilt expected tree from checkpoint"
                );
                Ok(map)
            }
            _ => {
                let mut map = BTreeMap::new();
                for entry in self.store.all_hash_entries(table)? {
                    map.insert(entry.record_id, entry.data_hash);
                }
                Ok(map)
            }
        }
    }

    /// Persist a fresh checkpoint after a successful pass. Replicated via
    /// consensus on the leader; written directly in single-node mode.
    async fn persist_checkpoint(
        &self,
        table: &str,
        tree: &MerkleTreeBuilder,
    ) -> Result<(), VerifyError> {
        let sequence_num = self
            .store
            .latest_hash_entry(table)?
            .map_or(0, |e| e.sequence_num);

        let checkpoint = MerkleCheckpoint {
            table_name: table.to_string(),
            sequence_num,
            merkle_root: tree.root().unwrap_or_default().to_string(),
            record_count: tree.leaf_count() as u64,
            timestamp: Utc::now(),
            hash_algorithm: self.hasher.algorithm().to_string(),
            tree_algorithm: TREE_ALGORITHM.to_string(),
            leaf_map: tree.leaf_map().clone(),
            internal_nodes: tree.internal_nodes(),
        };

        match &self.consensus {
            Some(consensus) => {
                match consensus
                    .apply_log(WitnessCommand::Checkpoint {
                        checkpoint: checkpoint.clone(),
                    })
                    .await
                {
                    Ok(_) => {}
                    // Followers receive the leader's checkpoint via
                    // replication.
                    Err(ConsensusError::NotLeader) => {
                        debug!(table = %table, "not the leader; skipping checkpoint");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            None => self.store.save_merkle_checkpoint(&checkpoint)?,
        }

        info!(
            table = %table,
            seq = checkpoint.sequence_num,
            records = checkpoint.record_count,
            algorithm = %checkpoint.hash_algorithm,
            "merkle checkpoint created"
        );
        Ok(())
    }

    /// Startup pass plus one periodic task per table.
    ///
    /// Each table's loop never overlaps itself: the next tick does not
    /// fire until the previous verification completes.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(tables = self.tables.len(), "running startup verification");
        for table in &self.tables {
            match self.verify_table(&table.name).await {
                Ok(report) => info!(table = %report.table, records = report.record_count,
                    "startup verification passed"),
                Err(e) => error!(table = %table.name, error = %e, "startup verification failed"),
            }
        }

        let mut tasks = Vec::new();
        for table in &self.tables {
            let interval = table.verify_interval.unwrap_or(DEFAULT_VERIFY_INTERVAL);
            let verifier = self.clone();
            let name = table.name.clone();
            let mut shutdown = shutdown.clone();

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = ticker.tick() => {
                            match verifier.verify_table(&name).await {
                                Ok(report) => debug!(table = %name, root = %report.merkle_root,
                                    "periodic verification passed"),
                                // Reported; the next tick retries.
                                Err(e) => error!(table = %name, error = %e,
                                    "periodic verification failed"),
                            }
                        }
                    }
                }
            }));
        }

        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Classify leaf-map differences into tamper records.
fn classify(
    expected: &BTreeMap<String, String>,
    actual: &BTreeMap<String, String>,
) -> Vec<TamperRecord> {
    diff_leaf_maps(expected, actual)
        .into_iter()
        .map(|diff| TamperRecord {
            record_id: diff.record_id,
            kind: match diff.kind {
                DiffKind::Modified => TamperKind::Modified,
                DiffKind::MissingInActual => TamperKind::Deleted,
                DiffKind::MissingInExpected => TamperKind::PhantomInsert,
            },
            expected_hash: diff.expected_hash,
            actual_hash: diff.actual_hash,
        })
        .collect()
}
