use thiserror::Error;

/// Errors surfaced by the store façade.
///
/// Statement-level SQL failures are never carried here; they are reported
/// inside [`crate::command::ExecuteResult`] / [`crate::command::QueryResult`]
/// so that a failing statement cannot fail the apply loop.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The operation requires the leader and this node is not it. Callers
    /// should redirect to the current leader and retry.
    #[error("not leader")]
    NotLeader,

    /// A bounded wait expired. For writes the proposal may still commit
    /// later; callers must treat the write as possibly applied.
    #[error("timeout expired")]
    Timeout,

    /// A `None`-consistency read exceeded the caller's freshness bound.
    #[error("stale read")]
    StaleRead,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Command envelope encode/decode failure. Fatal when hit during apply.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// I/O against the SQL file, the raft log, or a snapshot.
    #[error("storage error: {0}")]
    Storage(String),

    /// Error proxied from the consensus engine.
    #[error("consensus error: {0}")]
    Consensus(String),

    /// The store has been closed.
    #[error("store is closed")]
    Shutdown,
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
