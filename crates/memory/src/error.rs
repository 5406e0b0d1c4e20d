use thiserror::Error;
use uuid::Uuid;

use crate::schema::MemoryStatus;

/// Error taxonomy for the memory store and the pipeline built on it.
///
/// `Conflict` is recovered locally by re-reading and retrying; it never
/// reaches a caller outside the store/pipeline layer.  Validator failures and
/// retrieval timeouts are not errors at all — they surface as a status on the
/// resulting memory and a degraded-result flag respectively.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory {0} not found")]
    NotFound(Uuid),

    #[error("invalid transition {from:?} -> {to:?} for memory {id}")]
    InvalidTransition {
        id: Uuid,
        from: MemoryStatus,
        to: MemoryStatus,
    },

    #[error("version conflict on memory {id}: expected v{expected}, found v{found}")]
    Conflict { id: Uuid, expected: u64, found: u64 },

    #[error("invalid memory: {0}")]
    InvalidMemory(String),

    #[error("audit append failed: {0}")]
    Audit(#[source] std::io::Error),

    #[error("record journal append failed: {0}")]
    Journal(#[source] std::io::Error),

    #[error("persistence codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

impl MemoryError {
    /// Conflicts are transient by construction; everything else is either a
    /// caller bug or an I/O fault.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
