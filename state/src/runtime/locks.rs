use super::*;
use crate::LockLease;

impl MirrorRuntime {
    /// Attempts to take the lease on `name` for `owner`.
    ///
    /// Returns `true` when the lease was free, expired, or already held by
    /// `owner`. Returns `false` while another owner holds an unexpired lease.
    pub async fn try_acquire_lock(&self, name: &str, owner: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let lease_millis = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(lease_millis);
        let result = sqlx::query(
            r#"
INSERT INTO resource_locks (name, owner, acquired_at, expires_at)
VALUES (?, ?, ?, ?)
ON CONFLICT(name) DO UPDATE SET
    owner = excluded.owner,
    acquired_at = excluded.acquired_at,
    expires_at = excluded.expires_at
WHERE resource_locks.owner = excluded.owner
   OR resource_locks.expires_at <= excluded.acquired_at
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(now)
        .bind(expires_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Extends the lease on `name` by `lease` from now.
    ///
    /// Returns `false` when `owner` no longer holds the lease because another
    /// owner took it over or released it. A lease that lapsed without a
    /// takeover is still renewed.
    pub async fn renew_lock(&self, name: &str, owner: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let lease_millis = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "UPDATE resource_locks SET expires_at = ? WHERE name = ? AND owner = ?",
        )
        .bind(now.saturating_add(lease_millis))
        .bind(name)
        .bind(owner)
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Releases the lease on `name` if `owner` still holds it.
    pub async fn release_lock(&self, name: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM resource_locks WHERE name = ? AND owner = ?")
            .bind(name)
            .bind(owner)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn lock_lease(&self, name: &str) -> Result<Option<LockLease>> {
        let row = sqlx::query(
            r#"
SELECT name, owner, acquired_at, expires_at
FROM resource_locks
WHERE name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.as_ref().map(LockLease::try_from_row).transpose()
    }
}
