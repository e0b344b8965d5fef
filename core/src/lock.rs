use async_trait::async_trait;
use dsync_protocol::LockKey;

use crate::LockError;

/// A held resource lock. Dropping it without calling
/// [`ResourceLock::release`] leaves the lock to expire on its own.
#[async_trait]
pub trait ResourceLock: Send + Sync {
    fn key(&self) -> &LockKey;

    /// Extends a lease-based lock. `Ok(false)` means the lock was lost and
    /// another holder may have touched the resource since it was taken.
    async fn renew(&self) -> Result<bool, LockError> {
        Ok(true)
    }

    async fn release(self: Box<Self>) -> Result<(), LockError>;
}

/// Hands out named locks shared by every process of a deployment.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Tries once to take `key` without waiting.
    ///
    /// `Err(LockError::Contended)` means another process holds the lock;
    /// `Err(LockError::State)` means the manager is broken. `Ok(None)` is a
    /// refusal without a reported cause.
    async fn try_lock(&self, key: &LockKey) -> Result<Option<Box<dyn ResourceLock>>, LockError>;
}
