use thiserror::Error;

/// Everything that can go wrong inside the engine, split by what the caller is
/// expected to do about it.
///
/// Transient storage failures never surface here; the storage client retries
/// them internally and escalates to [`ChunkedGraphError::StorageExhausted`]
/// once the retry budget is spent.
#[derive(Debug, Error)]
pub enum ChunkedGraphError {
    /// The request itself is malformed (unresolvable coordinates, unknown ids,
    /// empty source/sink sets, ...).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request is well-formed but the graph state rejects it (same-root
    /// merge, unseparable split, ...). Nothing was written.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The graph was opened read-only.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A root lease could not be acquired or renewed within the retry budget.
    #[error("operation {operation_id}: locking failed: {reason}")]
    Locking { operation_id: u64, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Transient storage failures exhausted their backoff budget.
    #[error("storage error after retries: {0}")]
    StorageExhausted(String),

    /// A structural invariant does not hold (e.g. a supervoxel with no root).
    /// The process must not continue mutating the graph.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<sled::transaction::TransactionError<()>> for ChunkedGraphError {
    fn from(e: sled::transaction::TransactionError<()>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(()) => {
                Self::Internal("transaction aborted without reason".into())
            }
            sled::transaction::TransactionError::Storage(e) => Self::Storage(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChunkedGraphError>;
