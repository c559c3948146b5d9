//! Replicated-log and stable-state primitives for the consensus layer.
//!
//! [`ConsensusLog`] stores log entries keyed by 8-byte big-endian index in
//! a `logs` keyspace; [`StableStore`] is a small key/value space for votes
//! and applied-state markers. Both live in their own fjall databases under
//! the node's `raft/` directory, mirroring the on-disk layout
//! `raft/raft-log.db` and `raft/raft-stable.db`.

use std::path::Path;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};

use crate::error::{storage_err, StoreError};

type Result<T> = std::result::Result<T, StoreError>;

fn index_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

fn parse_index(key: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(key.try_into().ok()?))
}

/// Append-only log of consensus entries, keyed by index.
pub struct ConsensusLog {
    #[allow(dead_code)]
    db: Database,
    logs: Keyspace,
}

impl ConsensusLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open().map_err(storage_err)?;
        let logs = db
            .keyspace("logs", KeyspaceCreateOptions::default)
            .map_err(storage_err)?;
        Ok(Self { db, logs })
    }

    /// Store the encoded entry at `index` (idempotent overwrite).
    pub fn append(&self, index: u64, value: &[u8]) -> Result<()> {
        self.logs
            .insert(index_key(index), value)
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn get(&self, index: u64) -> Result<Option<Vec<u8>>> {
        Ok(self
            .logs
            .get(index_key(index))
            .map_err(storage_err)?
            .map(|v| v.to_vec()))
    }

    /// Entries in `[start, end)` index order. Keys are big-endian so the
    /// keyspace iterates numerically.
    pub fn range(&self, start: u64, end: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        let mut out = Vec::new();

        for guard in self.logs.iter() {
            let (key, value) = guard.into_inner().map_err(storage_err)?;
            let Some(index) = parse_index(&key) else {
                continue;
            };

            if index >= end {
                break;
            }
            if index >= start {
                out.push((index, value.to_vec()));
            }
        }

        Ok(out)
    }

    /// Delete all entries with index in `[start, end]` inclusive.
    pub fn delete_range(&self, start: u64, end: u64) -> Result<()> {
        let mut doomed = Vec::new();

        for guard in self.logs.iter() {
            let key = guard.key().map_err(storage_err)?;
            let Some(index) = parse_index(&key) else {
                continue;
            };
            if index > end {
                break;
            }
            if index >= start {
                doomed.push(key);
            }
        }

        for key in doomed {
            self.logs.remove(key).map_err(storage_err)?;
        }

        Ok(())
    }

    /// Smallest stored index, or `None` when the log is empty.
    pub fn first_index(&self) -> Result<Option<u64>> {
        for guard in self.logs.iter() {
            let key = guard.key().map_err(storage_err)?;
            if let Some(index) = parse_index(&key) {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Greatest stored index, or `None` when the log is empty.
    pub fn last_index(&self) -> Result<Option<u64>> {
        let mut last = None;
        for guard in self.logs.iter() {
            let key = guard.key().map_err(storage_err)?;
            if let Some(index) = parse_index(&key) {
                last = Some(index);
            }
        }
        Ok(last)
    }
}

/// Stable key/value state for consensus (votes, membership markers).
pub struct StableStore {
    #[allow(dead_code)]
    db: Database,
    stable: Keyspace,
}

impl StableStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open().map_err(storage_err)?;
        let stable = db
            .keyspace("stable", KeyspaceCreateOptions::default)
            .map_err(storage_err)?;
        Ok(Self { db, stable })
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.stable
            .insert(key.as_bytes(), value)
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .stable
            .get(key.as_bytes())
            .map_err(storage_err)?
            .map(|v| v.to_vec()))
    }

    pub fn set_u64(&self, key: &str, value: u64) -> Result<()> {
        self.set(key, &value.to_be_bytes())
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.get(key)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Storage(format!("invalid u64 value for {key}")))?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }
}
