use std::fmt;
use std::path::PathBuf;

use dsync_failure_log::FailureLogError;
use dsync_state::MirrorError;

/// Failure reported by the primary store after its own retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrimaryStoreError {
    #[error("index `{0}` does not exist")]
    IndexMissing(String),

    /// The client gave up after its own retries.
    #[error("primary store did not respond: {0}")]
    NoResponse(String),

    #[error("version conflict on `{id}`: expected {expected}, found {actual}")]
    VersionConflict { id: String, expected: i64, actual: i64 },

    #[error("document `{0}` does not exist")]
    NotFound(String),

    #[error("document `{id}` does not match the index mapping: {reason}")]
    SchemaMismatch { id: String, reason: String },

    #[error("primary store error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The lock manager itself is broken or unreachable.
    #[error("lock manager failed on `{key}`: {message}")]
    State { key: String, message: String },

    #[error("`{0}` is held by another process")]
    Contended(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AccessorError {
    #[error(transparent)]
    Primary(#[from] PrimaryStoreError),

    /// The durable store is configured but the pre-write check failed.
    #[error("durable store is unavailable: {0}")]
    MirrorUnavailable(#[source] MirrorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSide {
    Primary,
    Durable,
}

impl fmt::Display for StoreSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Durable => f.write_str("durable"),
        }
    }
}

/// Errors that abort a repair sweep.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("failure log directory {} is missing", .0.display())]
    Config(PathBuf),

    #[error(transparent)]
    Log(FailureLogError),

    #[error("primary store failed during repair: {0}")]
    Primary(#[source] PrimaryStoreError),

    #[error("durable store failed during repair: {0}")]
    Mirror(#[source] MirrorError),

    #[error("{store} store returned {count} documents for `{uuid}` in `{index}`")]
    MultipleHits {
        store: StoreSide,
        index: String,
        uuid: String,
        count: usize,
    },

    #[error(transparent)]
    Lock(LockError),

    #[error("a repair sweep is already running")]
    SweepInProgress,
}

impl From<FailureLogError> for RepairError {
    fn from(err: FailureLogError) -> Self {
        match err {
            FailureLogError::MissingDir(path) => Self::Config(path),
            other => Self::Log(other),
        }
    }
}
