//! Error taxonomy for the patch log engine

/// Result type for patch log operations
pub type Result<T> = std::result::Result<T, PatchLogError>;

/// Errors surfaced by the patch log engine.
///
/// Conflict and identity errors are expected, recoverable conditions for the
/// caller to act on. Integrity and storage errors are never repaired
/// silently; the affected source stops accepting appends until verified.
#[derive(Debug, thiserror::Error)]
pub enum PatchLogError {
    #[error("version conflict: expected head differs, current head is {current_head}")]
    VersionConflict { current_head: u64 },

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("duplicate source: {0}")]
    DuplicateSource(String),

    #[error("source deleted: {0}")]
    SourceDeleted(String),

    #[error("chain corruption at version {version}")]
    ChainCorruption { version: u64 },

    #[error("range not found: from {from} with head {head}")]
    RangeNotFound { from: u64, head: u64 },

    #[error("a submission for this source is already awaiting acknowledgment")]
    SubmissionInProgress,

    #[error("submission abandoned after {attempts} conflicting attempts")]
    SubmissionExhausted { attempts: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("storage backend error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl PatchLogError {
    /// The head version carried by a `VersionConflict`, if this is one
    pub fn conflict_head(&self) -> Option<u64> {
        match self {
            PatchLogError::VersionConflict { current_head } => Some(*current_head),
            _ => None,
        }
    }
}

impl From<bincode::Error> for PatchLogError {
    fn from(e: bincode::Error) -> Self {
        PatchLogError::Encoding(e.to_string())
    }
}
