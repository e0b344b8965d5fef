//! Write path: primary store first, then the durable mirror, with mirror
//! failures recorded in the failure log instead of surfacing to the caller.

use std::sync::Arc;

use dsync_failure_log::FailureLogWriter;
use dsync_protocol::Document;
use dsync_protocol::FailureRecord;
use dsync_protocol::NO_VERSION;
use dsync_protocol::OperationKind;
use dsync_state::MirrorError;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::AccessorError;
use crate::BulkRequest;
use crate::MirrorAccessor;
use crate::PrimaryStore;
use crate::PrimaryStoreError;
use crate::PrimaryWrite;
use crate::SearchHits;

/// Front of one primary index and its durable container.
///
/// Without a [`MirrorAccessor`] writes go to the primary store only.
pub struct DataSourceAccessor {
    index_name: String,
    primary: Arc<dyn PrimaryStore>,
    mirror: Option<MirrorAccessor>,
    failure_log: Arc<FailureLogWriter>,
}

impl DataSourceAccessor {
    pub fn new(
        index_name: impl Into<String>,
        primary: Arc<dyn PrimaryStore>,
        mirror: Option<MirrorAccessor>,
        failure_log: Arc<FailureLogWriter>,
    ) -> Self {
        Self {
            index_name: index_name.into(),
            primary,
            mirror,
            failure_log,
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub async fn create(&self, doc: &Document) -> Result<PrimaryWrite, AccessorError> {
        self.ensure_mirror_reachable().await?;
        let index = self.index_name.as_str();
        let write = self
            .with_index(|| self.primary.create(index, doc))
            .await?;
        if let Some(mirror) = &self.mirror
            && let Err(err) = mirror.create(index, doc).await
        {
            self.log_mirror_failure(OperationKind::Create, doc, write.version, &err)
                .await;
        }
        Ok(write)
    }

    /// Replaces `doc`; with `Some(version)` only when the primary copy is at
    /// that version.
    pub async fn update(
        &self,
        doc: &Document,
        version: Option<i64>,
    ) -> Result<PrimaryWrite, AccessorError> {
        self.ensure_mirror_reachable().await?;
        let index = self.index_name.as_str();
        let write = self
            .with_index(|| self.primary.update(index, doc, version))
            .await?;
        if let Some(mirror) = &self.mirror
            && let Err(err) = mirror.update(index, doc).await
        {
            self.log_mirror_failure(OperationKind::Update, doc, write.version, &err)
                .await;
        }
        Ok(write)
    }

    /// Deletes `doc`. Returns `None` when the primary index does not exist.
    pub async fn delete(
        &self,
        doc: &Document,
        version: Option<i64>,
    ) -> Result<Option<PrimaryWrite>, AccessorError> {
        self.ensure_mirror_reachable().await?;
        let index = self.index_name.as_str();
        let write = match self
            .primary
            .delete(index, &doc.doc_type, &doc.id, version)
            .await
        {
            Ok(write) => write,
            Err(PrimaryStoreError::IndexMissing(_)) => {
                debug!("index {index} is missing; nothing to delete for {}", doc.id);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        if let Some(mirror) = &self.mirror
            && let Err(err) = mirror.delete(index, doc.kind(), &doc.id).await
        {
            self.log_mirror_failure(OperationKind::Delete, doc, write.version, &err)
                .await;
        }
        Ok(Some(write))
    }

    pub async fn search(&self, doc_type: &str, ids: &[String]) -> Result<SearchHits, AccessorError> {
        Ok(self
            .primary
            .search_by_ids(&self.index_name, doc_type, ids)
            .await?)
    }

    /// Creates every document in one primary bulk request and one durable
    /// transaction. A failed mirror transaction logs one record per document.
    pub async fn bulk_create(&self, docs: &[Document]) -> Result<Vec<PrimaryWrite>, AccessorError> {
        self.ensure_mirror_reachable().await?;
        let index = self.index_name.as_str();
        let requests: Vec<BulkRequest> = docs.iter().cloned().map(BulkRequest::Create).collect();
        let writes = self
            .with_index(|| self.primary.bulk(index, &requests))
            .await?;
        if let Some(mirror) = &self.mirror
            && let Err(err) = mirror.bulk_create(index, docs).await
        {
            for (doc, write) in docs.iter().zip(&writes) {
                self.log_mirror_failure(OperationKind::Create, doc, write.version, &err)
                    .await;
            }
        }
        Ok(writes)
    }

    /// Updates `entities` and creates `links` between them. Link records are
    /// captured at version 1 when the mirror write fails.
    pub async fn bulk_update_with_links(
        &self,
        entities: &[Document],
        links: &[Document],
    ) -> Result<Vec<PrimaryWrite>, AccessorError> {
        self.ensure_mirror_reachable().await?;
        let index = self.index_name.as_str();
        let requests: Vec<BulkRequest> = entities
            .iter()
            .cloned()
            .map(BulkRequest::Update)
            .chain(links.iter().cloned().map(BulkRequest::Create))
            .collect();
        let writes = self
            .with_index(|| self.primary.bulk(index, &requests))
            .await?;
        if let Some(mirror) = &self.mirror
            && let Err(err) = mirror.bulk_update_with_links(index, entities, links).await
        {
            for (doc, write) in entities.iter().zip(&writes) {
                self.log_mirror_failure(OperationKind::Update, doc, write.version, &err)
                    .await;
            }
            for link in links {
                self.log_mirror_failure(OperationKind::Create, link, 1, &err)
                    .await;
            }
        }
        Ok(writes)
    }

    /// Marks every record of `cell_id` for cascading deletion. Repair never
    /// replays a failed mark; it lands in the error log for an operator.
    pub async fn cell_bulk_deletion(
        &self,
        cell_id: &str,
        unit_index: &str,
    ) -> Result<(), AccessorError> {
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };
        if let Err(err) = mirror.insert_cell_delete_mark(cell_id, unit_index).await {
            let record = FailureRecord {
                index_name: unit_index.to_string(),
                doc_type: "Cell".to_string(),
                lock_key: String::new(),
                cell_id: cell_id.to_string(),
                uuid: cell_id.to_string(),
                operation: OperationKind::CascadeDeleteMark,
                es_version: NO_VERSION,
                updated: chrono::Utc::now().timestamp_millis(),
            };
            self.append_failure(record, &err).await;
        }
        Ok(())
    }

    async fn ensure_mirror_reachable(&self) -> Result<(), AccessorError> {
        match &self.mirror {
            Some(mirror) => mirror
                .check_connection()
                .await
                .map_err(AccessorError::MirrorUnavailable),
            None => Ok(()),
        }
    }

    /// Runs `op`; when the primary index is missing, creates it together
    /// with the durable container and runs `op` once more.
    async fn with_index<F, Fut, T>(&self, op: F) -> Result<T, AccessorError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, PrimaryStoreError>>,
    {
        match op().await {
            Err(PrimaryStoreError::IndexMissing(index)) => {
                debug!("creating missing index {index}");
                self.primary.create_index(&index).await?;
                if let Some(mirror) = &self.mirror
                    && let Err(err) = mirror.create_container(&index).await
                {
                    warn!("failed to create durable container {index}: {err}");
                }
                Ok(op().await?)
            }
            other => Ok(other?),
        }
    }

    async fn log_mirror_failure(
        &self,
        operation: OperationKind,
        doc: &Document,
        es_version: i64,
        err: &MirrorError,
    ) {
        let record = FailureRecord {
            index_name: self.index_name.clone(),
            doc_type: doc.doc_type.clone(),
            lock_key: doc
                .lock_key()
                .map(|key| key.to_string())
                .unwrap_or_default(),
            cell_id: doc.cell_id.clone().unwrap_or_default(),
            uuid: doc.id.clone(),
            operation,
            es_version,
            updated: doc.updated,
        };
        self.append_failure(record, err).await;
    }

    async fn append_failure(&self, record: FailureRecord, err: &MirrorError) {
        warn!(
            index = %record.index_name,
            uuid = %record.uuid,
            "durable write failed, recording for repair: {err}"
        );
        if let Err(log_err) = self.failure_log.write_record(&record).await {
            error!(
                index = %record.index_name,
                uuid = %record.uuid,
                "failed to append failure record {record}: {log_err}"
            );
        }
    }
}
