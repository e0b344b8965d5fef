/// Failure of a durable-store operation, classified by what the caller should
/// do about it.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// The store could not be reached or stopped answering.
    #[error("durable store is unreachable: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("container `{0}` does not exist")]
    ContainerMissing(String),

    /// The record was rejected by the schema; retrying will not help.
    #[error("invalid data for `{id}`: {reason}")]
    InvalidData { id: String, reason: String },

    #[error("`{0}` already exists")]
    Conflict(String),

    #[error("`{0}` does not exist")]
    NotFound(String),

    #[error(transparent)]
    Database(sqlx::Error),
}

impl MirrorError {
    pub fn invalid(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidData {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Maps a driver error raised while writing `id`.
    pub(crate) fn from_write(id: &str, err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return Self::Conflict(id.to_string());
            }
            if db_err.is_check_violation() || db_err.is_foreign_key_violation() {
                return Self::invalid(id, db_err.message());
            }
        }
        Self::from(err)
    }
}

impl From<sqlx::Error> for MirrorError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(err),
            sqlx::Error::Database(db_err)
                if matches!(db_err.code().as_deref(), Some("5" | "6" | "14")) =>
            {
                // SQLITE_BUSY, SQLITE_LOCKED and SQLITE_CANTOPEN.
                Self::Connection(err)
            }
            _ => Self::Database(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
