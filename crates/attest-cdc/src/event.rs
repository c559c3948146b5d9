//! Change events and the handler seam.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use attest_hash::FieldValue;
use chrono::{DateTime, Utc};

use crate::error::HandlerError;

/// Row-level operation kinds carried by the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        })
    }
}

/// A decoded row as field-name → value.
pub type Row = BTreeMap<String, FieldValue>;

/// Logical stream offset (Postgres LSN).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// One committed row change, decoded from the stream.
///
/// Created by the decoder, consumed by handlers, discarded once the
/// upstream position is acknowledged.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table_name: String,
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
    pub new_data: Row,
    pub old_data: Row,
    /// Primary-key projection, extracted from key-flagged columns.
    pub primary_key: Row,
    /// Stream position of the carrying WAL record.
    pub lsn: Lsn,
}

impl ChangeEvent {
    /// Canonical string form of the primary key.
    ///
    /// A single `id` column renders as its bare value; composite keys
    /// render as `k=v` pairs joined by `,` in key order.
    pub fn record_id(&self) -> String {
        if self.primary_key.len() == 1 {
            if let Some(value) = self.primary_key.get("id") {
                return value.canonical_string();
            }
        }

        self.primary_key
            .iter()
            .map(|(name, value)| format!("{name}={}", value.canonical_string()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Consumer of ordered change events.
///
/// Handlers must be idempotent under duplicate delivery of the same
/// upstream position.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_change(&self, event: &ChangeEvent) -> Result<(), HandlerError>;
}
