//! Content hashing for witness entries.
//!
//! Two ingestion paths feed the witness pipeline: CDC deliveries (column
//! values in Postgres text form) and live-table reads (also text form, via
//! the simple-query protocol). [`ContentHasher::hash_record`] normalizes a
//! record to a canonical field-name → string map, serializes it as
//! key-sorted JSON, and digests the bytes with the configured algorithm, so
//! both paths produce the same digest for the same row.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher as _;

use blake2::digest::consts::U32;
use blake2::Blake2b;
use sha2::{Digest, Sha256};
use twox_hash::XxHash64;

/// Field names excluded from hashing unless overridden: CDC and direct
/// reads deliver these timestamps in different textual forms.
pub const DEFAULT_EXCLUDED_FIELDS: &[&str] = &["created_at", "updated_at"];

/// Errors from hasher construction.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// The configured algorithm name is not one of the supported set.
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// A single field value as observed from the database.
///
/// CDC and simple-query reads produce `Null` and `Text` only; the other
/// variants exist so callers holding native typed values normalize through
/// the same rule.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Bytes(Vec<u8>),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl FieldValue {
    /// Canonical string form: `Null` → `"<nil>"`, bytes → lowercase hex,
    /// text → itself, numerics and bools → their natural textual form.
    pub fn canonical_string(&self) -> String {
        match self {
            FieldValue::Null => "<nil>".to_string(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::Bytes(b) => hex::encode(b),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Bool(b) => b.to_string(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Integer(i)
    }
}

/// A row as a field-name → value map. `BTreeMap` keeps field order stable.
pub type Record = BTreeMap<String, FieldValue>;

/// Digest algorithm over raw bytes. Output is a lowercase hex string.
trait Algorithm: Send + Sync {
    fn digest(&self, data: &[u8]) -> String;
    fn name(&self) -> &'static str;
}

struct XxHash64Algorithm;

impl Algorithm for XxHash64Algorithm {
    fn digest(&self, data: &[u8]) -> String {
        let mut h = XxHash64::with_seed(0);
        h.write(data);
        hex::encode(h.finish().to_be_bytes())
    }

    fn name(&self) -> &'static str {
        "xxhash64"
    }
}

/// 128-bit variant built from two xxhash64 passes, the second over the
/// input prefixed with `0x01`.
struct XxHash128Algorithm;

impl Algorithm for XxHash128Algorithm {
    fn digest(&self, data: &[u8]) -> String {
        let mut first = XxHash64::with_seed(0);
        first.write(data);

        let mut second = XxHash64::with_seed(0);
        second.write(&[0x01]);
        second.write(data);

        format!(
            "{}{}",
            hex::encode(first.finish().to_be_bytes()),
            hex::encode(second.finish().to_be_bytes())
        )
    }

    fn name(&self) -> &'static str {
        "xxhash128"
    }
}

struct Sha256Algorithm;

impl Algorithm for Sha256Algorithm {
    fn digest(&self, data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn name(&self) -> &'static str {
        "sha256"
    }
}

struct Blake2b256Algorithm;

impl Algorithm for Blake2b256Algorithm {
    fn digest(&self, data: &[u8]) -> String {
        hex::encode(Blake2b::<U32>::digest(data))
    }

    fn name(&self) -> &'static str {
        "blake2b_256"
    }
}

struct Blake3Algorithm;

impl Algorithm for Blake3Algorithm {
    fn digest(&self, data: &[u8]) -> String {
        blake3::hash(data).to_hex().to_string()
    }

    fn name(&self) -> &'static str {
        "blake3"
    }
}

/// Content hasher: a configured digest algorithm plus the field-exclusion
/// list applied during record normalization.
///
/// Constructed once at startup and threaded explicitly through the handler,
/// the verifier, and the consensus FSM so the algorithm cannot drift
/// between subsystems.
pub struct ContentHasher {
    algorithm: Box<dyn Algorithm>,
    excluded_fields: Vec<String>,
}

impl ContentHasher {
    /// Build a hasher for `algorithm` with a custom exclusion list.
    pub fn new(algorithm: &str, excluded_fields: Vec<String>) -> Result<Self, HashError> {
        let algorithm: Box<dyn Algorithm> = match algorithm {
            "xxhash64" => Box::new(XxHash64Algorithm),
            "xxhash128" => Box::new(XxHash128Algorithm),
            "sha256" => Box::new(Sha256Algorithm),
            "blake2b_256" => Box::new(Blake2b256Algorithm),
            "blake3" => Box::new(Blake3Algorithm),
            other => return Err(HashError::UnsupportedAlgorithm(other.to_string())),
        };

        Ok(Self {
            algorithm,
            excluded_fields,
        })
    }

    /// Build a hasher with the default exclusion list.
    pub fn with_defaults(algorithm: &str) -> Result<Self, HashError> {
        Self::new(
            algorithm,
            DEFAULT_EXCLUDED_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    /// Digest raw bytes with the configured algorithm.
    pub fn hash_bytes(&self, data: &[u8]) -> String {
        self.algorithm.digest(data)
    }

    /// Digest a string with the configured algorithm.
    pub fn hash_str(&self, data: &str) -> String {
        self.algorithm.digest(data.as_bytes())
    }

    /// Normalize a record and digest it.
    ///
    /// Excluded fields are dropped, every remaining value is converted to
    /// its canonical string, and the map is serialized as JSON with sorted
    /// keys before hashing. Two records equal under normalization always
    /// produce the same digest.
    pub fn hash_record(&self, record: &Record) -> String {
        let normalized: BTreeMap<&str, String> = record
            .iter()
            .filter(|(name, _)| !self.excluded_fields.iter().any(|e| e == *name))
            .map(|(name, value)| (name.as_str(), value.canonical_string()))
            .collect();

        let json = serde_json::to_vec(&normalized).expect("serialization should not fail");
        self.algorithm.digest(&json)
    }

    /// Name of the configured algorithm, as recorded in checkpoints.
    pub fn algorithm(&self) -> &'static str {
        self.algorithm.name()
    }

    /// The field names excluded from record hashing.
    pub fn excluded_fields(&self) -> &[String] {
        &self.excluded_fields
    }
}

impl fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentHasher")
            .field("algorithm", &self.algorithm.name())
            .field("excluded_fields", &self.excluded_fields)
            .finish()
    }
}

/// All supported algorithm names, for config validation.
pub const ALGORITHMS: &[&str] = &["xxhash64", "xxhash128", "sha256", "blake2b_256", "blake3"];
