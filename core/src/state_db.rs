//! Binds the seams of this crate to the SQLite store in `dsync-state`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dsync_protocol::Document;
use dsync_protocol::LockKey;
use dsync_protocol::MirrorKind;
use dsync_state::MirrorError;
use dsync_state::MirrorRuntime;
use tracing::debug;
use uuid::Uuid;

use crate::Config;
use crate::LockError;
use crate::LockManager;
use crate::MirrorAccessor;
use crate::MirrorStore;
use crate::ResourceLock;

/// Handles on the SQLite durable store of one deployment.
#[derive(Clone)]
pub struct DurableStore {
    pub runtime: Arc<MirrorRuntime>,
    pub mirror: MirrorAccessor,
    pub locks: Arc<SqliteLockManager>,
}

/// Opens the durable store configured in `config`. Returns `None` when the
/// durable store is disabled.
pub async fn init(config: &Config) -> anyhow::Result<Option<DurableStore>> {
    if !config.durable.enabled {
        debug!("durable store disabled");
        return Ok(None);
    }
    let runtime = MirrorRuntime::init(config.durable.database.clone()).await?;
    let locks = Arc::new(SqliteLockManager::new(
        Arc::clone(&runtime),
        config.repair.lock_lease,
    ));
    Ok(Some(DurableStore {
        mirror: MirrorAccessor::new(runtime.clone()),
        runtime,
        locks,
    }))
}

#[async_trait]
impl MirrorStore for MirrorRuntime {
    async fn check_connection(&self) -> Result<(), MirrorError> {
        MirrorRuntime::check_connection(self).await
    }

    async fn create_container(&self, index: &str) -> Result<(), MirrorError> {
        MirrorRuntime::create_container(self, index).await?;
        Ok(())
    }

    async fn insert(&self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        self.insert_record(index, doc).await
    }

    async fn update(&self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        self.update_record(index, doc).await
    }

    async fn delete(&self, index: &str, kind: MirrorKind, id: &str) -> Result<(), MirrorError> {
        if !self.delete_record(index, kind, id).await? {
            debug!("durable record {index}/{id} was already absent");
        }
        Ok(())
    }

    async fn search_by_ids(
        &self,
        index: &str,
        kind: MirrorKind,
        ids: &[String],
    ) -> Result<Vec<Document>, MirrorError> {
        let records = self.find_records(index, kind, ids).await?;
        Ok(records.into_iter().map(|record| record.document).collect())
    }

    async fn insert_many(&self, index: &str, docs: &[Document]) -> Result<(), MirrorError> {
        self.insert_records(index, docs).await
    }

    async fn update_with_links(
        &self,
        index: &str,
        entities: &[Document],
        links: &[Document],
    ) -> Result<(), MirrorError> {
        self.update_records_with_links(index, entities, links).await
    }

    async fn insert_cell_delete_mark(
        &self,
        cell_id: &str,
        unit_index: &str,
    ) -> Result<(), MirrorError> {
        MirrorRuntime::insert_cell_delete_mark(self, cell_id, unit_index).await
    }
}

/// Lease-based locks stored next to the mirrored records, shared by every
/// process that opens the same database.
///
/// Each acquisition uses a fresh owner id, so a second `try_lock` on a held
/// key reports contention even from the same process. A lease that is never
/// released expires after `lease`.
pub struct SqliteLockManager {
    runtime: Arc<MirrorRuntime>,
    lease: Duration,
}

impl SqliteLockManager {
    pub fn new(runtime: Arc<MirrorRuntime>, lease: Duration) -> Self {
        Self { runtime, lease }
    }
}

#[async_trait]
impl LockManager for SqliteLockManager {
    async fn try_lock(&self, key: &LockKey) -> Result<Option<Box<dyn ResourceLock>>, LockError> {
        let name = key.to_string();
        let owner = Uuid::new_v4().to_string();
        let acquired = self
            .runtime
            .try_acquire_lock(&name, &owner, self.lease)
            .await
            .map_err(|err| LockError::State {
                key: name.clone(),
                message: err.to_string(),
            })?;
        if !acquired {
            return Err(LockError::Contended(name));
        }
        Ok(Some(Box::new(SqliteLock {
            key: key.clone(),
            owner,
            lease: self.lease,
            runtime: Arc::clone(&self.runtime),
        })))
    }
}

struct SqliteLock {
    key: LockKey,
    owner: String,
    lease: Duration,
    runtime: Arc<MirrorRuntime>,
}

#[async_trait]
impl ResourceLock for SqliteLock {
    fn key(&self) -> &LockKey {
        &self.key
    }

    async fn renew(&self) -> Result<bool, LockError> {
        let name = self.key.to_string();
        self.runtime
            .renew_lock(&name, &self.owner, self.lease)
            .await
            .map_err(|err| LockError::State {
                key: name.clone(),
                message: err.to_string(),
            })
    }

    async fn release(self: Box<Self>) -> Result<(), LockError> {
        let name = self.key.to_string();
        let released = self
            .runtime
            .release_lock(&name, &self.owner)
            .await
            .map_err(|err| LockError::State {
                key: name.clone(),
                message: err.to_string(),
            })?;
        if !released {
            debug!("lease on {name} had already expired");
        }
        Ok(())
    }
}
