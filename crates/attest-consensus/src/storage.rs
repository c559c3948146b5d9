//! openraft storage over the fjall-backed consensus stores, with the
//! witness store as the applied state machine.

use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use openraft::storage::{LogState, RaftLogReader, RaftSnapshotBuilder, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, OptionalSend, RaftStorage, SnapshotMeta, StorageError,
    StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use attest_store::raft::{ConsensusLog, StableStore};
use attest_store::{HashEntry, WitnessStore};

use crate::types::{NodeId, SnapshotDocument, TypeConfig, WitnessCommand, WitnessResponse};

const KEY_VOTE: &str = "vote";
const KEY_LAST_PURGED: &str = "last_purged";
const KEY_APPLIED_STATE: &str = "applied_state";

/// Current snapshot file, kept under `raft/snapshots/`.
const SNAPSHOT_FILE: &str = "current.json";

/// Hook invoked by the FSM as committed hash entries land.
///
/// The follower guard implements this: a conflicting local entry at the
/// same `(table, sequence)` is definitive evidence that this node's
/// history diverged from the majority.
pub trait FsmObserver: Send + Sync {
    /// A committed entry conflicts with a locally stored one.
    fn on_divergence(&self, table: &str, sequence_num: u64, local_hash: &str, consensus_hash: &str);

    /// A committed entry was persisted.
    fn on_applied(&self, _entry: &HashEntry) {}
}

/// Applied-state marker persisted in the stable store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AppliedState {
    last_applied: Option<LogId<NodeId>>,
    membership: StoredMembership<NodeId, BasicNode>,
}

/// Snapshot file layout: metadata plus the JSON witness document.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    meta: SnapshotMeta<NodeId, BasicNode>,
    data: SnapshotDocument,
}

/// The replicated log, stable state, and witness FSM for one node.
#[derive(Clone)]
pub struct RaftWitnessStore {
    log: Arc<ConsensusLog>,
    stable: Arc<StableStore>,
    witness: Arc<WitnessStore>,
    observer: Option<Arc<dyn FsmObserver>>,
    snapshot_dir: PathBuf,

    vote_cache: Arc<RwLock<Option<Vote<NodeId>>>>,
    last_purged_cache: Arc<RwLock<Option<LogId<NodeId>>>>,
    applied_cache: Arc<RwLock<AppliedState>>,
}

impl RaftWitnessStore {
    pub fn new(
        log: ConsensusLog,
        stable: StableStore,
        witness: Arc<WitnessStore>,
        snapshot_dir: PathBuf,
        observer: Option<Arc<dyn FsmObserver>>,
    ) -> Result<Self, StorageError<NodeId>> {
        let vote = read_json(&stable, KEY_VOTE)?;
        let last_purged = read_json(&stable, KEY_LAST_PURGED)?;
        let applied: Option<AppliedState> = read_json(&stable, KEY_APPLIED_STATE)?;

        std::fs::create_dir_all(&snapshot_dir)
            .map_err(|e| io_error(&e, "create snapshot directory"))?;

        Ok(Self {
            log: Arc::new(log),
            stable: Arc::new(stable),
            witness,
            observer,
            snapshot_dir,
            vote_cache: Arc::new(RwLock::new(vote)),
            last_purged_cache: Arc::new(RwLock::new(last_purged)),
            applied_cache: Arc::new(RwLock::new(applied.unwrap_or_default())),
        })
    }

    pub fn witness(&self) -> &Arc<WitnessStore> {
        &self.witness
    }

    /// Apply one committed command against the witness store.
    ///
    /// Sequence allocation happens here, from the store's latest entry:
    /// deterministic in commit order on every node. A redelivered command
    /// matching the tail entry is a no-op; a command for the tail record
    /// with a different local hash is divergence and halts application.
    fn apply_command(&self, command: &WitnessCommand) -> Result<WitnessResponse, StorageError<NodeId>> {
        match command {
            WitnessCommand::HashChain {
                table_name,
                record_id,
                data_hash,
                operation_type,
                timestamp,
            } => {
                let latest = self
                    .witness
                    .latest_hash_entry(table_name)
                    .map_err(|e| store_error(&e))?;

                if let Some(prev) = &latest {
                    if prev.record_id == *record_id {
                        // Redelivery of the entry already at the tail.
                        if prev.data_hash == *data_hash {
                            debug!(
                                table = %table_name,
                                seq = prev.sequence_num,
                                "duplicate hash-chain command absorbed"
                            );
                            return Ok(WitnessResponse {
                                sequence_num: Some(prev.sequence_num),
                            });
                        }

                        // Same record, different local hash: this node's
                        // history disagrees with the majority-agreed entry.
                        // The local entry is left untouched (append-only);
                        // the observer alerts, flags, and decides whether
                        // the node keeps running.
                        warn!(
                            table = %table_name,
                            seq = prev.sequence_num,
                            local = %prev.data_hash,
                            consensus = %data_hash,
                            "local history diverged from consensus"
                        );
                        if let Some(observer) = &self.observer {
                            observer.on_divergence(
                                table_name,
                                prev.sequence_num,
                                &prev.data_hash,
                                data_hash,
                            );
                        }
                        return Ok(WitnessResponse::default());
                    }
                }

                let sequence_num = latest.map_or(1, |e| e.sequence_num + 1);

                let entry = HashEntry {
                    table_name: table_name.clone(),
                    sequence_num,
                    record_id: record_id.clone(),
                    data_hash: data_hash.clone(),
                    operation_type: operation_type.clone(),
                    timestamp: *timestamp,
                };

                self.witness
                    .save_hash_entry(&entry)
                    .map_err(|e| store_error(&e))?;

                if let Some(observer) = &self.observer {
                    observer.on_applied(&entry);
                }

                debug!(table = %table_name, seq = sequence_num, "hash entry applied");
                Ok(WitnessResponse {
                    sequence_num: Some(sequence_num),
                })
            }
            WitnessCommand::Checkpoint { checkpoint } => {
                self.witness
                    .save_merkle_checkpoint(checkpoint)
                    .map_err(|e| store_error(&e))?;

                info!(
                    table = %checkpoint.table_name,
                    seq = checkpoint.sequence_num,
                    records = checkpoint.record_count,
                    "checkpoint applied"
                );
                Ok(WitnessResponse::default())
            }
        }
    }

    fn persist_applied(&self, state: &AppliedState) -> Result<(), StorageError<NodeId>> {
        write_json(&self.stable, KEY_APPLIED_STATE, state)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.snapshot_dir.join(SNAPSHOT_FILE)
    }

    /// Serialize the full witness state into a snapshot document.
    fn build_snapshot_document(&self) -> Result<SnapshotDocument, StorageError<NodeId>> {
        Ok(SnapshotDocument {
            hash_entries: self
                .witness
                .all_hash_entries_all_tables()
                .map_err(|e| store_error(&e))?,
            merkle_checkpoints: self
                .witness
                .all_merkle_checkpoints()
                .map_err(|e| store_error(&e))?,
        })
    }
}

fn frame_type(entry: &Entry<TypeConfig>) -> u8 {
    match &entry.payload {
        EntryPayload::Blank => 0,
        EntryPayload::Normal(_) => 1,
        EntryPayload::Membership(_) => 2,
    }
}

/// Fixed log value frame:
/// `index (u64 BE) | term (u64 BE) | type (u8) | data_len (u32 BE) | data`.
pub(crate) fn encode_entry(entry: &Entry<TypeConfig>) -> Result<Vec<u8>, StorageError<NodeId>> {
    let data = serde_json::to_vec(entry).map_err(|e| codec_error(&e))?;

    let mut buf = Vec::with_capacity(8 + 8 + 1 + 4 + data.len());
    buf.extend_from_slice(&entry.log_id.index.to_be_bytes());
    buf.extend_from_slice(&entry.log_id.leader_id.term.to_be_bytes());
    buf.push(frame_type(entry));
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(&data);
    Ok(buf)
}

pub(crate) fn decode_entry(buf: &[u8]) -> Result<Entry<TypeConfig>, StorageError<NodeId>> {
    if buf.len() < 21 {
        return Err(StorageError::from_io_error(
            openraft::ErrorSubject::Logs,
            openraft::ErrorVerb::Read,
            std::io::Error::other(format!("log value too short: {} bytes", buf.len())),
        ));
    }

    let data_len = u32::from_be_bytes(buf[17..21].try_into().expect("4 bytes")) as usize;
    let data = buf
        .get(21..21 + data_len)
        .ok_or_else(|| {
            StorageError::from_io_error(
                openraft::ErrorSubject::Logs,
                openraft::ErrorVerb::Read,
                std::io::Error::other("log value truncated"),
            )
        })?;

    serde_json::from_slice(data).map_err(|e| codec_error(&e))
}

// ----- openraft trait implementations -----

impl RaftLogReader<TypeConfig> for RaftWitnessStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        use std::ops::Bound;

        let start = match range.start_bound() {
            Bound::Included(&i) => i,
            Bound::Excluded(&i) => i.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&i) => i.saturating_add(1),
            Bound::Excluded(&i) => i,
            Bound::Unbounded => u64::MAX,
        };

        let mut entries = Vec::new();
        for (_, value) in self.log.range(start, end).map_err(|e| store_error(&e))? {
            entries.push(decode_entry(&value)?);
        }
        Ok(entries)
    }
}

impl RaftSnapshotBuilder<TypeConfig> for RaftWitnessStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let document = self.build_snapshot_document()?;
        let applied = self.applied_cache.read().unwrap().clone();

        let snapshot_id = format!(
            "snapshot-{}-{}",
            applied.last_applied.map_or(0, |l| l.index),
            chrono::Utc::now().timestamp(),
        );
        let meta = SnapshotMeta {
            last_log_id: applied.last_applied,
            last_membership: applied.membership,
            snapshot_id,
        };

        let file = SnapshotFile {
            meta: meta.clone(),
            data: document,
        };
        let bytes = serde_json::to_vec(&file).map_err(|e| codec_error(&e))?;

        std::fs::write(self.snapshot_path(), &bytes)
            .map_err(|e| io_error(&e, "write snapshot file"))?;

        let data = serde_json::to_vec(&file.data).map_err(|e| codec_error(&e))?;
        info!(
            snapshot_id = %meta.snapshot_id,
            entries = file.data.hash_entries.len(),
            "snapshot built"
        );

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

#[allow(deprecated)]
impl RaftStorage<TypeConfig> for RaftWitnessStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged = *self.last_purged_cache.read().unwrap();

        let last_log_id = match self.log.last_index().map_err(|e| store_error(&e))? {
            Some(index) => {
                let value = self
                    .log
                    .get(index)
                    .map_err(|e| store_error(&e))?
                    .ok_or_else(|| {
                        StorageError::from_io_error(
                            openraft::ErrorSubject::Logs,
                            openraft::ErrorVerb::Read,
                            std::io::Error::other(format!("log entry {index} missing")),
                        )
                    })?;
                Some(decode_entry(&value)?.log_id)
            }
            None => last_purged,
        };

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        write_json(&self.stable, KEY_VOTE, vote)?;
        *self.vote_cache.write().unwrap() = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(*self.vote_cache.read().unwrap())
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        for entry in entries {
            let value = encode_entry(&entry)?;
            self.log
                .append(entry.log_id.index, &value)
                .map_err(|e| store_error(&e))?;
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.log
            .delete_range(log_id.index, u64::MAX)
            .map_err(|e| store_error(&e))
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log
            .delete_range(0, log_id.index)
            .map_err(|e| store_error(&e))?;

        write_json(&self.stable, KEY_LAST_PURGED, &log_id)?;
        *self.last_purged_cache.write().unwrap() = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        let state = self.applied_cache.read().unwrap().clone();
        Ok((state.last_applied, state.membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<WitnessResponse>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());
        let mut state = self.applied_cache.read().unwrap().clone();

        for entry in entries {
            state.last_applied = Some(entry.log_id);

            let response = match &entry.payload {
                EntryPayload::Blank => WitnessResponse::default(),
                EntryPayload::Normal(command) => self.apply_command(command)?,
                EntryPayload::Membership(membership) => {
                    state.membership =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    WitnessResponse::default()
                }
            };

            responses.push(response);
        }

        self.persist_applied(&state)?;
        *self.applied_cache.write().unwrap() = state;
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let document: SnapshotDocument =
            serde_json::from_slice(snapshot.get_ref()).map_err(|e| codec_error(&e))?;

        for entry in &document.hash_entries {
            self.witness
                .save_hash_entry(entry)
                .map_err(|e| store_error(&e))?;
        }
        for checkpoint in &document.merkle_checkpoints {
            self.witness
                .save_merkle_checkpoint(checkpoint)
                .map_err(|e| store_error(&e))?;
        }

        let state = AppliedState {
            last_applied: meta.last_log_id,
            membership: meta.last_membership.clone(),
        };
        self.persist_applied(&state)?;
        *self.applied_cache.write().unwrap() = state;

        let file = SnapshotFile {
            meta: meta.clone(),
            data: document,
        };
        if let Ok(bytes) = serde_json::to_vec(&file) {
            if let Err(e) = std::fs::write(self.snapshot_path(), bytes) {
                warn!(error = %e, "failed to persist installed snapshot");
            }
        }

        info!(
            snapshot_id = %meta.snapshot_id,
            entries = file.data.hash_entries.len(),
            "snapshot installed"
        );
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }

        let bytes = std::fs::read(&path).map_err(|e| io_error(&e, "read snapshot file"))?;
        let file: SnapshotFile = serde_json::from_slice(&bytes).map_err(|e| codec_error(&e))?;
        let data = serde_json::to_vec(&file.data).map_err(|e| codec_error(&e))?;

        Ok(Some(Snapshot {
            meta: file.meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}

// ----- error helpers -----

fn store_error<E: std::error::Error>(e: &E) -> StorageError<NodeId> {
    StorageError::from_io_error(
        openraft::ErrorSubject::Store,
        openraft::ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

fn codec_error<E: std::error::Error>(e: &E) -> StorageError<NodeId> {
    StorageError::from_io_error(
        openraft::ErrorSubject::Store,
        openraft::ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

fn io_error(e: &std::io::Error, context: &str) -> StorageError<NodeId> {
    StorageError::from_io_error(
        openraft::ErrorSubject::Snapshot(None),
        openraft::ErrorVerb::Write,
        std::io::Error::other(format!("{context}: {e}")),
    )
}

fn read_json<T: serde::de::DeserializeOwned>(
    stable: &StableStore,
    key: &str,
) -> Result<Option<T>, StorageError<NodeId>> {
    match stable.get(key).map_err(|e| store_error(&e))? {
        Some(bytes) => Ok(Some(
            serde_json::from_slice(&bytes).map_err(|e| codec_error(&e))?,
        )),
        None => Ok(None),
    }
}

fn write_json<T: Serialize>(
    stable: &StableStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError<NodeId>> {
    let bytes = serde_json::to_vec(value).map_err(|e| codec_error(&e))?;
    stable.set(key, &bytes).map_err(|e| store_error(&e))
}
