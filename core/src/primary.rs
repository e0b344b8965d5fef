use async_trait::async_trait;
use dsync_protocol::Document;

use crate::PrimaryStoreError;

/// Outcome of a successful primary write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryWrite {
    pub id: String,
    /// Document version after the write.
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub version: i64,
    pub document: Document,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    pub total: u64,
    pub hits: Vec<Hit>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkRequest {
    Create(Document),
    Update(Document),
}

impl BulkRequest {
    pub fn document(&self) -> &Document {
        match self {
            Self::Create(doc) | Self::Update(doc) => doc,
        }
    }
}

/// Client of the search-indexed primary store.
///
/// Implementations retry transient failures themselves and report
/// [`PrimaryStoreError::NoResponse`] once they give up. Writes into an index
/// that does not exist fail with [`PrimaryStoreError::IndexMissing`].
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    async fn create(&self, index: &str, doc: &Document) -> Result<PrimaryWrite, PrimaryStoreError>;

    /// Replaces `doc`. With `Some(version)` the write only applies when the
    /// stored version matches.
    async fn update(
        &self,
        index: &str,
        doc: &Document,
        version: Option<i64>,
    ) -> Result<PrimaryWrite, PrimaryStoreError>;

    async fn delete(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        version: Option<i64>,
    ) -> Result<PrimaryWrite, PrimaryStoreError>;

    async fn search_by_ids(
        &self,
        index: &str,
        doc_type: &str,
        ids: &[String],
    ) -> Result<SearchHits, PrimaryStoreError>;

    /// Applies every request and returns one write per request, in order.
    async fn bulk(
        &self,
        index: &str,
        requests: &[BulkRequest],
    ) -> Result<Vec<PrimaryWrite>, PrimaryStoreError>;

    async fn create_index(&self, index: &str) -> Result<(), PrimaryStoreError>;
}
