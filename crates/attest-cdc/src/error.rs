//! Error types for the CDC crate.

/// Errors from the replication stream and decoder.
#[derive(Debug, thiserror::Error)]
pub enum CdcError {
    /// Connection-level failure (connect, stream, ack).
    #[error("replication connection error: {0}")]
    Connection(#[from] tokio_postgres::Error),

    /// The stream ended unexpectedly.
    #[error("replication stream closed")]
    StreamClosed,

    /// A wire message could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A row referenced a relation id before its descriptor arrived.
    #[error("unknown relation id: {0}")]
    UnknownRelation(u32),

    /// A handler rejected the event; dispatch for it was aborted.
    #[error("handler failed: {0}")]
    Dispatch(#[source] HandlerError),
}

/// Errors returned by event handlers.
///
/// Tamper is a detection outcome, not a transient fault; it is surfaced to
/// the alert sink by the handler itself and aborts dispatch so the
/// position is not advanced.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("tampering detected: {operation} on append-only table {table}")]
    Tamper { table: String, operation: String },

    #[error("{0}")]
    Other(String),
}
