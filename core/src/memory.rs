//! In-process implementations of the store and lock seams.
//!
//! They keep everything in memory, can be told to fail, and can record every
//! call into a shared [`Journal`] so callers can check the order of
//! operations across stores.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use async_trait::async_trait;
use dsync_protocol::Document;
use dsync_protocol::LockKey;
use dsync_protocol::MirrorKind;
use dsync_state::MirrorError;

use crate::BulkRequest;
use crate::Hit;
use crate::LockError;
use crate::LockManager;
use crate::MirrorStore;
use crate::PrimaryStore;
use crate::PrimaryStoreError;
use crate::PrimaryWrite;
use crate::ResourceLock;
use crate::SearchHits;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered record of calls made against the in-memory collaborators.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

#[derive(Default)]
struct PrimaryState {
    indexes: HashMap<String, HashMap<String, Hit>>,
    faults: VecDeque<PrimaryStoreError>,
    duplicated: HashSet<String>,
    off_page: HashSet<String>,
}

impl PrimaryState {
    fn take_fault(&mut self) -> Result<(), PrimaryStoreError> {
        match self.faults.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn index_mut(&mut self, index: &str) -> Result<&mut HashMap<String, Hit>, PrimaryStoreError> {
        self.indexes
            .get_mut(index)
            .ok_or_else(|| PrimaryStoreError::IndexMissing(index.to_string()))
    }

    fn create(&mut self, index: &str, doc: &Document) -> Result<PrimaryWrite, PrimaryStoreError> {
        let docs = self.index_mut(index)?;
        if let Some(existing) = docs.get(&doc.id) {
            return Err(PrimaryStoreError::VersionConflict {
                id: doc.id.clone(),
                expected: 0,
                actual: existing.version,
            });
        }
        docs.insert(
            doc.id.clone(),
            Hit {
                version: 1,
                document: doc.clone(),
            },
        );
        Ok(PrimaryWrite {
            id: doc.id.clone(),
            version: 1,
        })
    }

    fn update(
        &mut self,
        index: &str,
        doc: &Document,
        version: Option<i64>,
    ) -> Result<PrimaryWrite, PrimaryStoreError> {
        let docs = self.index_mut(index)?;
        let Some(hit) = docs.get_mut(&doc.id) else {
            return Err(PrimaryStoreError::NotFound(doc.id.clone()));
        };
        check_version(&doc.id, version, hit.version)?;
        hit.version += 1;
        hit.document = doc.clone();
        Ok(PrimaryWrite {
            id: doc.id.clone(),
            version: hit.version,
        })
    }
}

fn check_version(id: &str, expected: Option<i64>, actual: i64) -> Result<(), PrimaryStoreError> {
    match expected {
        Some(expected) if expected != actual => Err(PrimaryStoreError::VersionConflict {
            id: id.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

/// Versioned document store with index semantics: creates start at
/// version 1 and every update or delete bumps the version by one.
#[derive(Default)]
pub struct MemoryPrimaryStore {
    state: Mutex<PrimaryState>,
    journal: Option<Journal>,
}

impl MemoryPrimaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn create_index_now(&self, index: &str) {
        lock(&self.state)
            .indexes
            .entry(index.to_string())
            .or_default();
    }

    pub fn index_exists(&self, index: &str) -> bool {
        lock(&self.state).indexes.contains_key(index)
    }

    /// Stores `doc` at `version`, creating the index when needed.
    pub fn put(&self, index: &str, doc: Document, version: i64) {
        lock(&self.state)
            .indexes
            .entry(index.to_string())
            .or_default()
            .insert(
                doc.id.clone(),
                Hit {
                    version,
                    document: doc,
                },
            );
    }

    pub fn get(&self, index: &str, id: &str) -> Option<Hit> {
        lock(&self.state)
            .indexes
            .get(index)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    pub fn remove(&self, index: &str, id: &str) -> Option<Hit> {
        lock(&self.state)
            .indexes
            .get_mut(index)
            .and_then(|docs| docs.remove(id))
    }

    /// Makes the next call fail with `err`.
    pub fn fail_next(&self, err: PrimaryStoreError) {
        lock(&self.state).faults.push_back(err);
    }

    /// Makes searches return the document with id `id` twice.
    pub fn duplicate_hits(&self, id: &str) {
        lock(&self.state).duplicated.insert(id.to_string());
    }

    /// Makes searches count a second copy of `id` in `total` without
    /// returning it, as a paged search would.
    pub fn duplicate_off_page(&self, id: &str) {
        lock(&self.state).off_page.insert(id.to_string());
    }

    fn note(&self, entry: String) {
        if let Some(journal) = &self.journal {
            journal.record(entry);
        }
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn create(&self, index: &str, doc: &Document) -> Result<PrimaryWrite, PrimaryStoreError> {
        self.note(format!("primary.create {index}/{}", doc.id));
        let mut state = lock(&self.state);
        state.take_fault()?;
        state.create(index, doc)
    }

    async fn update(
        &self,
        index: &str,
        doc: &Document,
        version: Option<i64>,
    ) -> Result<PrimaryWrite, PrimaryStoreError> {
        self.note(format!("primary.update {index}/{}", doc.id));
        let mut state = lock(&self.state);
        state.take_fault()?;
        state.update(index, doc, version)
    }

    async fn delete(
        &self,
        index: &str,
        _doc_type: &str,
        id: &str,
        version: Option<i64>,
    ) -> Result<PrimaryWrite, PrimaryStoreError> {
        self.note(format!("primary.delete {index}/{id}"));
        let mut state = lock(&self.state);
        state.take_fault()?;
        let docs = state.index_mut(index)?;
        let Some(hit) = docs.get(id) else {
            return Err(PrimaryStoreError::NotFound(id.to_string()));
        };
        check_version(id, version, hit.version)?;
        let version = hit.version + 1;
        docs.remove(id);
        Ok(PrimaryWrite {
            id: id.to_string(),
            version,
        })
    }

    async fn search_by_ids(
        &self,
        index: &str,
        doc_type: &str,
        ids: &[String],
    ) -> Result<SearchHits, PrimaryStoreError> {
        self.note(format!("primary.search {index}/{}", ids.join(",")));
        let mut state = lock(&self.state);
        state.take_fault()?;
        let Some(docs) = state.indexes.get(index) else {
            return Ok(SearchHits::default());
        };
        let mut hits = Vec::new();
        let mut off_page = 0;
        for id in ids {
            let Some(hit) = docs.get(id) else {
                continue;
            };
            if hit.document.doc_type != doc_type {
                continue;
            }
            hits.push(hit.clone());
            if state.duplicated.contains(id) {
                hits.push(hit.clone());
            }
            if state.off_page.contains(id) {
                off_page += 1;
            }
        }
        Ok(SearchHits {
            total: hits.len() as u64 + off_page,
            hits,
        })
    }

    async fn bulk(
        &self,
        index: &str,
        requests: &[BulkRequest],
    ) -> Result<Vec<PrimaryWrite>, PrimaryStoreError> {
        self.note(format!("primary.bulk {index} x{}", requests.len()));
        let mut state = lock(&self.state);
        state.take_fault()?;
        state.index_mut(index)?;
        requests
            .iter()
            .map(|request| match request {
                BulkRequest::Create(doc) => state.create(index, doc),
                BulkRequest::Update(doc) => state.update(index, doc, None),
            })
            .collect()
    }

    async fn create_index(&self, index: &str) -> Result<(), PrimaryStoreError> {
        self.note(format!("primary.create_index {index}"));
        let mut state = lock(&self.state);
        state.take_fault()?;
        state.indexes.entry(index.to_string()).or_default();
        Ok(())
    }
}

/// Failure to inject into [`MemoryMirrorStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorFault {
    Connection,
    InvalidData,
    Conflict,
    Other,
}

impl MirrorFault {
    fn into_error(self, id: &str) -> MirrorError {
        match self {
            Self::Connection => MirrorError::Connection(sqlx_pool_timeout()),
            Self::InvalidData => MirrorError::invalid(id, "rejected by injected fault"),
            Self::Conflict => MirrorError::Conflict(id.to_string()),
            Self::Other => MirrorError::Database(sqlx::Error::Protocol(
                "injected failure".to_string(),
            )),
        }
    }
}

fn sqlx_pool_timeout() -> sqlx::Error {
    sqlx::Error::PoolTimedOut
}

type RecordKey = (String, MirrorKind, String);

#[derive(Default)]
struct MirrorState {
    containers: HashSet<String>,
    records: HashMap<RecordKey, Document>,
    faults: VecDeque<MirrorFault>,
    unreachable: bool,
    duplicated: HashSet<String>,
    delete_marks: Vec<(String, String)>,
}

impl MirrorState {
    fn check_reachable(&self) -> Result<(), MirrorError> {
        if self.unreachable {
            Err(MirrorError::Connection(sqlx_pool_timeout()))
        } else {
            Ok(())
        }
    }

    fn begin_write(&mut self, index: &str, id: &str) -> Result<(), MirrorError> {
        self.check_reachable()?;
        if let Some(fault) = self.faults.pop_front() {
            return Err(fault.into_error(id));
        }
        if !self.containers.contains(index) {
            return Err(MirrorError::ContainerMissing(index.to_string()));
        }
        Ok(())
    }

    fn insert(&mut self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        let key = (index.to_string(), doc.kind(), doc.id.clone());
        if self.records.contains_key(&key) {
            return Err(MirrorError::Conflict(doc.id.clone()));
        }
        self.records.insert(key, doc.normalized());
        Ok(())
    }

    fn update(&mut self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        let key = (index.to_string(), doc.kind(), doc.id.clone());
        match self.records.get_mut(&key) {
            Some(stored) => {
                *stored = doc.normalized();
                Ok(())
            }
            None => Err(MirrorError::NotFound(doc.id.clone())),
        }
    }
}

/// Durable store kept in memory, with the same container and normalization
/// rules as the SQLite store.
#[derive(Default)]
pub struct MemoryMirrorStore {
    state: Mutex<MirrorState>,
    journal: Option<Journal>,
}

impl MemoryMirrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn create_container_now(&self, index: &str) {
        lock(&self.state).containers.insert(index.to_string());
    }

    pub fn has_container(&self, index: &str) -> bool {
        lock(&self.state).containers.contains(index)
    }

    /// Stores `doc` as is, creating the container when needed.
    pub fn put(&self, index: &str, doc: Document) {
        let mut state = lock(&self.state);
        state.containers.insert(index.to_string());
        state
            .records
            .insert((index.to_string(), doc.kind(), doc.id.clone()), doc.normalized());
    }

    pub fn get(&self, index: &str, kind: MirrorKind, id: &str) -> Option<Document> {
        lock(&self.state)
            .records
            .get(&(index.to_string(), kind, id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes the next write fail with `fault`.
    pub fn fail_next(&self, fault: MirrorFault) {
        lock(&self.state).faults.push_back(fault);
    }

    /// Makes every call fail with a connection error while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Makes searches return the record with id `id` twice.
    pub fn duplicate_hits(&self, id: &str) {
        lock(&self.state).duplicated.insert(id.to_string());
    }

    pub fn cell_delete_marks(&self) -> Vec<(String, String)> {
        lock(&self.state).delete_marks.clone()
    }

    fn note(&self, entry: String) {
        if let Some(journal) = &self.journal {
            journal.record(entry);
        }
    }
}

#[async_trait]
impl MirrorStore for MemoryMirrorStore {
    async fn check_connection(&self) -> Result<(), MirrorError> {
        lock(&self.state).check_reachable()
    }

    async fn create_container(&self, index: &str) -> Result<(), MirrorError> {
        self.note(format!("mirror.create_container {index}"));
        let mut state = lock(&self.state);
        state.check_reachable()?;
        state.containers.insert(index.to_string());
        Ok(())
    }

    async fn insert(&self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        self.note(format!("mirror.insert {index}/{}", doc.id));
        let mut state = lock(&self.state);
        state.begin_write(index, &doc.id)?;
        state.insert(index, doc)
    }

    async fn update(&self, index: &str, doc: &Document) -> Result<(), MirrorError> {
        self.note(format!("mirror.update {index}/{}", doc.id));
        let mut state = lock(&self.state);
        state.begin_write(index, &doc.id)?;
        state.update(index, doc)
    }

    async fn delete(&self, index: &str, kind: MirrorKind, id: &str) -> Result<(), MirrorError> {
        self.note(format!("mirror.delete {index}/{id}"));
        let mut state = lock(&self.state);
        state.begin_write(index, id)?;
        state
            .records
            .remove(&(index.to_string(), kind, id.to_string()));
        Ok(())
    }

    async fn search_by_ids(
        &self,
        index: &str,
        kind: MirrorKind,
        ids: &[String],
    ) -> Result<Vec<Document>, MirrorError> {
        self.note(format!("mirror.search {index}/{}", ids.join(",")));
        let state = lock(&self.state);
        state.check_reachable()?;
        let mut found = Vec::new();
        for id in ids {
            if let Some(doc) = state.records.get(&(index.to_string(), kind, id.clone())) {
                found.push(doc.clone());
                if state.duplicated.contains(id) {
                    found.push(doc.clone());
                }
            }
        }
        Ok(found)
    }

    async fn insert_many(&self, index: &str, docs: &[Document]) -> Result<(), MirrorError> {
        self.note(format!("mirror.insert_many {index} x{}", docs.len()));
        let mut state = lock(&self.state);
        let first = docs.first().map_or("", |doc| doc.id.as_str());
        state.begin_write(index, first)?;
        let snapshot = state.records.clone();
        for doc in docs {
            if let Err(err) = state.insert(index, doc) {
                state.records = snapshot;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn update_with_links(
        &self,
        index: &str,
        entities: &[Document],
        links: &[Document],
    ) -> Result<(), MirrorError> {
        self.note(format!(
            "mirror.update_with_links {index} x{}+{}",
            entities.len(),
            links.len()
        ));
        let mut state = lock(&self.state);
        let first = entities.first().map_or("", |doc| doc.id.as_str());
        state.begin_write(index, first)?;
        let snapshot = state.records.clone();
        let result = entities
            .iter()
            .try_for_each(|doc| state.update(index, doc))
            .and_then(|()| links.iter().try_for_each(|link| state.insert(index, link)));
        if result.is_err() {
            state.records = snapshot;
        }
        result
    }

    async fn insert_cell_delete_mark(
        &self,
        cell_id: &str,
        unit_index: &str,
    ) -> Result<(), MirrorError> {
        self.note(format!("mirror.cell_delete_mark {unit_index}/{cell_id}"));
        let mut state = lock(&self.state);
        state.check_reachable()?;
        if let Some(fault) = state.faults.pop_front() {
            return Err(fault.into_error(cell_id));
        }
        let mark = (cell_id.to_string(), unit_index.to_string());
        if !state.delete_marks.contains(&mark) {
            state.delete_marks.push(mark);
        }
        Ok(())
    }
}

#[derive(Default)]
struct LockState {
    held: HashSet<LockKey>,
    elsewhere: HashSet<LockKey>,
    state_error: bool,
    refuse: bool,
    lapse: bool,
    acquired: usize,
    released: usize,
}

/// Process-local lock manager that can simulate locks held by other
/// processes.
#[derive(Default)]
pub struct MemoryLockManager {
    state: Arc<Mutex<LockState>>,
    journal: Option<Journal>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Marks `key` as held by another process.
    pub fn hold_elsewhere(&self, key: LockKey) {
        lock(&self.state).elsewhere.insert(key);
    }

    pub fn release_elsewhere(&self, key: &LockKey) {
        lock(&self.state).elsewhere.remove(key);
    }

    /// Makes every acquisition fail with [`LockError::State`] while set.
    pub fn set_state_error(&self, state_error: bool) {
        lock(&self.state).state_error = state_error;
    }

    /// Makes every acquisition return no lock while set.
    pub fn set_refuse(&self, refuse: bool) {
        lock(&self.state).refuse = refuse;
    }

    /// Makes renewals of held locks report a lost lease while set.
    pub fn set_lapse(&self, lapse: bool) {
        lock(&self.state).lapse = lapse;
    }

    pub fn acquired(&self) -> usize {
        lock(&self.state).acquired
    }

    pub fn released(&self) -> usize {
        lock(&self.state).released
    }

    pub fn held(&self) -> usize {
        lock(&self.state).held.len()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn try_lock(&self, key: &LockKey) -> Result<Option<Box<dyn ResourceLock>>, LockError> {
        let mut state = lock(&self.state);
        if state.state_error {
            return Err(LockError::State {
                key: key.to_string(),
                message: "injected lock manager failure".to_string(),
            });
        }
        if state.refuse {
            return Ok(None);
        }
        if state.elsewhere.contains(key) || state.held.contains(key) {
            return Err(LockError::Contended(key.to_string()));
        }
        state.held.insert(key.clone());
        state.acquired += 1;
        if let Some(journal) = &self.journal {
            journal.record(format!("lock {key}"));
        }
        Ok(Some(Box::new(MemoryLock {
            key: key.clone(),
            state: Arc::clone(&self.state),
            journal: self.journal.clone(),
        })))
    }
}

struct MemoryLock {
    key: LockKey,
    state: Arc<Mutex<LockState>>,
    journal: Option<Journal>,
}

#[async_trait]
impl ResourceLock for MemoryLock {
    fn key(&self) -> &LockKey {
        &self.key
    }

    async fn renew(&self) -> Result<bool, LockError> {
        Ok(!lock(&self.state).lapse)
    }

    async fn release(self: Box<Self>) -> Result<(), LockError> {
        let mut state = lock(&self.state);
        if !state.held.remove(&self.key) {
            return Err(LockError::State {
                key: self.key.to_string(),
                message: "lock released twice".to_string(),
            });
        }
        state.released += 1;
        if let Some(journal) = &self.journal {
            journal.record(format!("unlock {}", self.key));
        }
        Ok(())
    }
}
