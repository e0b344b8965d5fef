use chrono::DateTime;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::MirrorError;

/// A lease on a named resource lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    /// Token of the holder; only the holder can release the lease.
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    /// The lease can be taken over by another owner after this instant.
    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self, MirrorError> {
        let name: String = row.try_get("name")?;
        let acquired_at = epoch_millis_to_datetime(&name, row.try_get("acquired_at")?)?;
        let expires_at = epoch_millis_to_datetime(&name, row.try_get("expires_at")?)?;
        Ok(Self {
            owner: row.try_get("owner")?,
            name,
            acquired_at,
            expires_at,
        })
    }
}

fn epoch_millis_to_datetime(name: &str, millis: i64) -> Result<DateTime<Utc>, MirrorError> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| MirrorError::invalid(name, format!("invalid timestamp: {millis}")))
}
