//! Per-kind writes into the durable store.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dsync_protocol::Document;
use dsync_protocol::MirrorKind;
use dsync_state::MirrorError;
use tracing::debug;

/// Client of the durable store.
///
/// Writes into a container that does not exist fail with
/// [`MirrorError::ContainerMissing`]. Connectivity failures are reported as
/// [`MirrorError::Connection`], rejected data as [`MirrorError::InvalidData`].
#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn check_connection(&self) -> Result<(), MirrorError>;

    async fn create_container(&self, index: &str) -> Result<(), MirrorError>;

    async fn insert(&self, index: &str, doc: &Document) -> Result<(), MirrorError>;

    async fn update(&self, index: &str, doc: &Document) -> Result<(), MirrorError>;

    async fn delete(&self, index: &str, kind: MirrorKind, id: &str) -> Result<(), MirrorError>;

    async fn search_by_ids(
        &self,
        index: &str,
        kind: MirrorKind,
        ids: &[String],
    ) -> Result<Vec<Document>, MirrorError>;

    /// Inserts all documents or none of them.
    async fn insert_many(&self, index: &str, docs: &[Document]) -> Result<(), MirrorError>;

    /// Updates `entities` and inserts `links`, all or nothing.
    async fn update_with_links(
        &self,
        index: &str,
        entities: &[Document],
        links: &[Document],
    ) -> Result<(), MirrorError>;

    async fn insert_cell_delete_mark(&self, cell_id: &str, unit_index: &str)
    -> Result<(), MirrorError>;
}

/// Typed front of a [`MirrorStore`] used by both the write path and repair.
///
/// Every write that hits a missing container creates the container and is
/// retried once.
#[derive(Clone)]
pub struct MirrorAccessor {
    store: Arc<dyn MirrorStore>,
}

impl MirrorAccessor {
    pub fn new(store: Arc<dyn MirrorStore>) -> Self {
        Self { store }
    }

    pub async fn check_connection(&self) -> Result<(), MirrorError> {
        self.store.check_connection().await
    }

    pub async fn create_container(&self, index: &str) -> Result<(), MirrorError> {
        self.store.create_container(index).await
    }

    pub async fn create_entity(&self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        expect_kind(doc, MirrorKind::Entity)?;
        self.with_container(index, || self.store.insert(index, doc))
            .await
    }

    pub async fn update_entity(&self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        expect_kind(doc, MirrorKind::Entity)?;
        self.with_container(index, || self.store.update(index, doc))
            .await
    }

    pub async fn delete_entity(&self, index: &str, id: &str) -> Result<(), MirrorError> {
        self.delete(index, MirrorKind::Entity, id).await
    }

    pub async fn create_link(&self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        expect_kind(doc, MirrorKind::Link)?;
        self.with_container(index, || self.store.insert(index, doc))
            .await
    }

    pub async fn update_link(&self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        expect_kind(doc, MirrorKind::Link)?;
        self.with_container(index, || self.store.update(index, doc))
            .await
    }

    pub async fn delete_link(&self, index: &str, id: &str) -> Result<(), MirrorError> {
        self.delete(index, MirrorKind::Link, id).await
    }

    pub async fn create_cell(&self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        expect_kind(doc, MirrorKind::Cell)?;
        self.with_container(index, || self.store.insert(index, doc))
            .await
    }

    pub async fn update_cell(&self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        expect_kind(doc, MirrorKind::Cell)?;
        self.with_container(index, || self.store.update(index, doc))
            .await
    }

    pub async fn delete_cell(&self, index: &str, id: &str) -> Result<(), MirrorError> {
        self.delete(index, MirrorKind::Cell, id).await
    }

    pub async fn create_dav_node(&self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        expect_kind(doc, MirrorKind::DavNode)?;
        self.with_container(index, || self.store.insert(index, doc))
            .await
    }

    pub async fn update_dav_node(&self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        expect_kind(doc, MirrorKind::DavNode)?;
        self.with_container(index, || self.store.update(index, doc))
            .await
    }

    pub async fn delete_dav_node(&self, index: &str, id: &str) -> Result<(), MirrorError> {
        self.delete(index, MirrorKind::DavNode, id).await
    }

    /// Creates `doc` through the operation matching its type.
    pub async fn create(&self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        match doc.kind() {
            MirrorKind::Entity => self.create_entity(index, doc).await,
            MirrorKind::Cell => self.create_cell(index, doc).await,
            MirrorKind::Link => self.create_link(index, doc).await,
            MirrorKind::DavNode => self.create_dav_node(index, doc).await,
        }
    }

    /// Updates `doc` through the operation matching its type.
    pub async fn update(&self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        match doc.kind() {
            MirrorKind::Entity => self.update_entity(index, doc).await,
            MirrorKind::Cell => self.update_cell(index, doc).await,
            MirrorKind::Link => self.update_link(index, doc).await,
            MirrorKind::DavNode => self.update_dav_node(index, doc).await,
        }
    }

    pub async fn delete(&self, index: &str, kind: MirrorKind, id: &str) -> Result<(), MirrorError> {
        self.with_container(index, || self.store.delete(index, kind, id))
            .await
    }

    pub async fn bulk_create(&self, index: &str, docs: &[Document]) -> Result<(), MirrorError> {
        self.with_container(index, || self.store.insert_many(index, docs))
            .await
    }

    pub async fn bulk_update_with_links(
        &self,
        index: &str,
        entities: &[Document],
        links: &[Document],
    ) -> Result<(), MirrorError> {
        for link in links {
            expect_kind(link, MirrorKind::Link)?;
        }
        self.with_container(index, || self.store.update_with_links(index, entities, links))
            .await
    }

    pub async fn search_by_ids(
        &self,
        index: &str,
        kind: MirrorKind,
        ids: &[String],
    ) -> Result<Vec<Document>, MirrorError> {
        self.store.search_by_ids(index, kind, ids).await
    }

    pub async fn insert_cell_delete_mark(
        &self,
        cell_id: &str,
        unit_index: &str,
    ) -> Result<(), MirrorError> {
        self.store.insert_cell_delete_mark(cell_id, unit_index).await
    }

    async fn with_container<F, Fut>(&self, index: &str, op: F) -> Result<(), MirrorError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), MirrorError>>,
    {
        match op().await {
            Err(MirrorError::ContainerMissing(_)) => {
                debug!("creating missing durable container {index}");
                self.store.create_container(index).await?;
                op().await
            }
            other => other,
        }
    }
}

fn expect_kind(doc: &Document, kind: MirrorKind) -> Result<(), MirrorError> {
    if doc.kind() == kind {
        Ok(())
    } else {
        Err(MirrorError::invalid(
            &doc.id,
            format!("type `{}` is not stored as {kind}", doc.doc_type),
        ))
    }
}
