use dsync_failure_log::FailureLogWriter;
use dsync_protocol::Document;
use dsync_protocol::FailureRecord;
use dsync_protocol::LockKey;
use dsync_protocol::MirrorKind;
use dsync_state::MirrorError;
use tracing::info;
use tracing::warn;

use super::RepairEngine;
use crate::Hit;
use crate::LockError;
use crate::PrimaryStoreError;
use crate::RepairError;
use crate::ResourceLock;
use crate::SearchHits;
use crate::StoreSide;
use crate::config::admin_index;

/// What a repair does to the durable copy of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    Create,
    Update,
    Delete,
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The durable copy already equals the primary document.
    AlreadyInSync,
    /// The primary document moved on since the failure was recorded; a later
    /// record covers it.
    StaleVersion { captured: i64, current: i64 },
    AbsentInBoth,
}

/// Decides how to bring the durable copy in line with the primary store.
///
/// `es_version` is the primary version captured when the mirror write failed.
pub fn decide(es_version: i64, primary: Option<&Hit>, durable: Option<&Document>) -> ReconcileAction {
    match (primary, durable) {
        (Some(_), None) => ReconcileAction::Create,
        (Some(hit), Some(stored)) if hit.version == es_version => {
            if *stored == hit.document.normalized() {
                ReconcileAction::Skip(SkipReason::AlreadyInSync)
            } else {
                ReconcileAction::Update
            }
        }
        (Some(hit), Some(_)) => ReconcileAction::Skip(SkipReason::StaleVersion {
            captured: es_version,
            current: hit.version,
        }),
        (None, Some(_)) => ReconcileAction::Delete,
        (None, None) => ReconcileAction::Skip(SkipReason::AbsentInBoth),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Applied(ReconcileAction),
    Retried,
    Quarantined,
}

pub(crate) struct Sinks<'a> {
    pub(crate) retry: &'a FailureLogWriter,
    pub(crate) error: &'a FailureLogWriter,
}

impl Sinks<'_> {
    async fn retry(&self, record: &FailureRecord, reason: &str) -> Result<Outcome, RepairError> {
        info!(
            index = %record.index_name,
            uuid = %record.uuid,
            lock_key = %record.lock_key,
            "deferring repair to the next sweep: {reason}"
        );
        self.retry.write_record(record).await?;
        Ok(Outcome::Retried)
    }

    async fn quarantine(&self, record: &FailureRecord, reason: &str) -> Result<Outcome, RepairError> {
        warn!(
            index = %record.index_name,
            uuid = %record.uuid,
            lock_key = %record.lock_key,
            "moving record to the error log: {reason}"
        );
        self.error.write_record(record).await?;
        Ok(Outcome::Quarantined)
    }
}

impl RepairEngine {
    /// Repairs one record under its resource lock.
    pub(crate) async fn reconcile(
        &self,
        record: &FailureRecord,
        sinks: &Sinks<'_>,
    ) -> Result<Outcome, RepairError> {
        if record.lock_key.is_empty() {
            return self.reconcile_locked(record, sinks, None).await;
        }
        let key = match record.lock_key.parse::<LockKey>() {
            Ok(key) => key,
            Err(err) => return sinks.quarantine(record, &err.to_string()).await,
        };
        let lock = match self.locks.try_lock(&key).await {
            Ok(Some(lock)) => lock,
            Ok(None) => return sinks.quarantine(record, "lock manager refused the lock").await,
            Err(LockError::Contended(_)) => return sinks.retry(record, "resource is locked").await,
            Err(err @ LockError::State { .. }) => return Err(RepairError::Lock(err)),
        };

        let outcome = self.reconcile_locked(record, sinks, Some(lock.as_ref())).await;
        release(lock).await;
        outcome
    }

    async fn reconcile_locked(
        &self,
        record: &FailureRecord,
        sinks: &Sinks<'_>,
        lock: Option<&dyn ResourceLock>,
    ) -> Result<Outcome, RepairError> {
        let kind = MirrorKind::from_doc_type(&record.doc_type);
        let primary = self.primary_hit(record, kind).await?;
        let durable = self.durable_hit(record, kind).await?;

        let action = decide(record.es_version, primary.as_ref(), durable.as_ref());
        let writes = matches!(
            action,
            ReconcileAction::Create | ReconcileAction::Update | ReconcileAction::Delete
        );
        // A lease may lapse during slow lookups; the comparison above is only
        // valid while the lock is still ours.
        if writes
            && let Some(lock) = lock
            && !lock.renew().await.map_err(RepairError::Lock)?
        {
            return sinks
                .retry(record, "resource lock lapsed before the durable write")
                .await;
        }
        let index = record.index_name.as_str();
        let written = match (&action, &primary) {
            (ReconcileAction::Create, Some(hit)) => self.mirror.create(index, &hit.document).await,
            (ReconcileAction::Update, Some(hit)) => self.mirror.update(index, &hit.document).await,
            (ReconcileAction::Delete, _) => self.mirror.delete(index, kind, &record.uuid).await,
            _ => Ok(()),
        };

        match written {
            Ok(()) => {
                info!(
                    index,
                    uuid = %record.uuid,
                    lock_key = %record.lock_key,
                    "repair decision {action:?}"
                );
                Ok(Outcome::Applied(action))
            }
            Err(MirrorError::InvalidData { reason, .. }) => sinks.quarantine(record, &reason).await,
            Err(err) if err.is_connection() => Err(RepairError::Mirror(err)),
            Err(err) => sinks.retry(record, &err.to_string()).await,
        }
    }

    async fn primary_hit(
        &self,
        record: &FailureRecord,
        kind: MirrorKind,
    ) -> Result<Option<Hit>, RepairError> {
        let index = match kind {
            MirrorKind::Cell => admin_index(&self.unit_prefix),
            _ => record.index_name.clone(),
        };
        let ids = [record.uuid.clone()];
        let found = match self
            .primary
            .search_by_ids(&index, &record.doc_type, &ids)
            .await
        {
            Ok(found) => found,
            Err(PrimaryStoreError::IndexMissing(_)) => SearchHits::default(),
            Err(err) => return Err(RepairError::Primary(err)),
        };
        // `total` counts matches beyond the returned page.
        let count = usize::try_from(found.total)
            .unwrap_or(usize::MAX)
            .max(found.hits.len());
        ensure_unique(count, StoreSide::Primary, &index, &record.uuid)?;
        Ok(found.hits.into_iter().next())
    }

    async fn durable_hit(
        &self,
        record: &FailureRecord,
        kind: MirrorKind,
    ) -> Result<Option<Document>, RepairError> {
        let ids = [record.uuid.clone()];
        let found = self
            .mirror
            .search_by_ids(&record.index_name, kind, &ids)
            .await
            .map_err(RepairError::Mirror)?;
        ensure_unique(found.len(), StoreSide::Durable, &record.index_name, &record.uuid)?;
        Ok(found.into_iter().next())
    }
}

fn ensure_unique(count: usize, store: StoreSide, index: &str, uuid: &str) -> Result<(), RepairError> {
    if count > 1 {
        return Err(RepairError::MultipleHits {
            store,
            index: index.to_string(),
            uuid: uuid.to_string(),
            count,
        });
    }
    Ok(())
}

async fn release(lock: Box<dyn ResourceLock>) {
    let key = lock.key().to_string();
    if let Err(err) = lock.release().await {
        warn!(lock_key = %key, "failed to release repair lock: {err}");
    }
}
