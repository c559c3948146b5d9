//! Error types for the store crate.

/// Errors from the witness and consensus stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Storage backend error (open, read, write, commit).
    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted value failed to decode. The caller decides policy.
    #[error("corrupt value at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization of a value to be written failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub(crate) fn storage_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(e.to_string())
}
