//! The witness store: fjall-backed persistence for hash entries,
//! Merkle checkpoints, and metadata.

use std::path::Path;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};

use crate::entry::{HashEntry, MerkleCheckpoint};
use crate::error::{storage_err, StoreError};

type Result<T> = std::result::Result<T, StoreError>;

/// Durable witness storage with three keyspaces:
///
/// - `hashchain`: hash entries keyed `table_name:sequence_num`
/// - `metadata`: generic string key/value flags
/// - `merkle_checkpoints`: latest checkpoint per table
///
/// Safe for concurrent readers; writers serialize through fjall's commit
/// path. Every mutation is committed before the call returns.
pub struct WitnessStore {
    #[allow(dead_code)]
    db: Database,
    hashchain: Keyspace,
    metadata: Keyspace,
    checkpoints: Keyspace,
}

fn entry_key(table_name: &str, sequence_num: u64) -> String {
    format!("{table_name}:{sequence_num}")
}

/// Parse the sequence number back out of a `table:seq` key.
///
/// Keys are not zero-padded, so lexicographic iteration order is not
/// numeric order; callers compare parsed sequence numbers instead.
fn parse_sequence(key: &[u8], prefix_len: usize) -> Option<u64> {
    std::str::from_utf8(key.get(prefix_len..)?)
        .ok()?
        .parse()
        .ok()
}

impl WitnessStore {
    /// Open (or create) a witness store at `path`.
    ///
    /// Fails fast when another process holds the database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open().map_err(storage_err)?;
        Self::init(db)
    }

    /// Open a temporary store, cleaned up on drop. For tests and tooling.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir().map_err(storage_err)?;
        let db = Database::builder(tmp.path())
            .temporary(true)
            .open()
            .map_err(storage_err)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let hashchain = db
            .keyspace("hashchain", KeyspaceCreateOptions::default)
            .map_err(storage_err)?;
        let metadata = db
            .keyspace("metadata", KeyspaceCreateOptions::default)
            .map_err(storage_err)?;
        let checkpoints = db
            .keyspace("merkle_checkpoints", KeyspaceCreateOptions::default)
            .map_err(storage_err)?;

        Ok(Self {
            db,
            hashchain,
            metadata,
            checkpoints,
        })
    }

    // ----- Hash entries -----

    /// Persist a hash entry under `table:seq`.
    pub fn save_hash_entry(&self, entry: &HashEntry) -> Result<()> {
        let key = entry_key(&entry.table_name, entry.sequence_num);
        let value = serde_json::to_vec(entry)?;
        self.hashchain
            .insert(key.as_bytes(), value)
            .map_err(storage_err)?;
        Ok(())
    }

    /// Fetch one entry by table and sequence number.
    pub fn get_hash_entry(&self, table_name: &str, sequence_num: u64) -> Result<Option<HashEntry>> {
        let key = entry_key(table_name, sequence_num);
        let bytes = self
            .hashchain
            .get(key.as_bytes())
            .map_err(storage_err)?
            .map(|v| v.to_vec());

        match bytes {
            Some(b) => Ok(Some(decode_entry(&key, &b)?)),
            None => Ok(None),
        }
    }

    /// The entry with the greatest sequence number for a table, if any.
    pub fn latest_hash_entry(&self, table_name: &str) -> Result<Option<HashEntry>> {
        let prefix = format!("{table_name}:");
        let mut latest: Option<(u64, Vec<u8>, String)> = None;

        for guard in self.hashchain.prefix(prefix.as_bytes()) {
            let (key, value) = guard.into_inner().map_err(storage_err)?;
            let Some(seq) = parse_sequence(&key, prefix.len()) else {
                continue;
            };

            if latest.as_ref().map_or(true, |(s, _, _)| seq > *s) {
                let key_str = String::from_utf8_lossy(&key).into_owned();
                latest = Some((seq, value.to_vec(), key_str));
            }
        }

        match latest {
            Some((_, bytes, key)) => Ok(Some(decode_entry(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// All entries for a table, ordered by sequence number.
    pub fn all_hash_entries(&self, table_name: &str) -> Result<Vec<HashEntry>> {
        let prefix = format!("{table_name}:");
        let mut entries = Vec::new();

        for guard in self.hashchain.prefix(prefix.as_bytes()) {
            let (key, value) = guard.into_inner().map_err(storage_err)?;
            let key_str = String::from_utf8_lossy(&key).into_owned();
            entries.push(decode_entry(&key_str, &value)?);
        }

        entries.sort_by_key(|e| e.sequence_num);
        Ok(entries)
    }

    /// Every entry across every table, ordered by table then sequence.
    /// Used for consensus snapshots.
    pub fn all_hash_entries_all_tables(&self) -> Result<Vec<HashEntry>> {
        let mut entries = Vec::new();

        for guard in self.hashchain.iter() {
            let (key, value) = guard.into_inner().map_err(storage_err)?;
            let key_str = String::from_utf8_lossy(&key).into_owned();
            entries.push(decode_entry(&key_str, &value)?);
        }

        entries.sort_by(|a, b| {
            a.table_name
                .cmp(&b.table_name)
                .then(a.sequence_num.cmp(&b.sequence_num))
        });
        Ok(entries)
    }

    // ----- Merkle checkpoints -----

    /// Persist the latest checkpoint for a table (overwrites the previous).
    pub fn save_merkle_checkpoint(&self, checkpoint: &MerkleCheckpoint) -> Result<()> {
        let value = serde_json::to_vec(checkpoint)?;
        self.checkpoints
            .insert(checkpoint.table_name.as_bytes(), value)
            .map_err(storage_err)?;
        Ok(())
    }

    /// The most recent checkpoint for a table, if one exists.
    pub fn latest_merkle_checkpoint(&self, table_name: &str) -> Result<Option<MerkleCheckpoint>> {
        let bytes = self
            .checkpoints
            .get(table_name.as_bytes())
            .map_err(storage_err)?
            .map(|v| v.to_vec());

        match bytes {
            Some(b) => Ok(Some(serde_json::from_slice(&b).map_err(|source| {
                StoreError::Corrupt {
                    key: table_name.to_string(),
                    source,
                }
            })?)),
            None => Ok(None),
        }
    }

    /// All checkpoints across tables. Used for consensus snapshots.
    pub fn all_merkle_checkpoints(&self) -> Result<Vec<MerkleCheckpoint>> {
        let mut checkpoints = Vec::new();

        for guard in self.checkpoints.iter() {
            let (key, value) = guard.into_inner().map_err(storage_err)?;
            let key_str = String::from_utf8_lossy(&key).into_owned();
            checkpoints.push(
                serde_json::from_slice(&value)
                    .map_err(|source| StoreError::Corrupt { key: key_str, source })?,
            );
        }

        Ok(checkpoints)
    }

    // ----- Metadata -----

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.metadata
            .insert(key.as_bytes(), value.as_bytes())
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let bytes = self.metadata.get(key.as_bytes()).map_err(storage_err)?;
        Ok(bytes.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }
}

fn decode_entry(key: &str, bytes: &[u8]) -> Result<HashEntry> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}
