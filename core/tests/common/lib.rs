//! Fixtures shared by the `dsync-core` integration suite.

use std::sync::Arc;

use dsync_core::DataSourceAccessor;
use dsync_core::MirrorAccessor;
use dsync_core::MirrorStore;
use dsync_core::RepairEngine;
use dsync_core::memory::Journal;
use dsync_core::memory::MemoryLockManager;
use dsync_core::memory::MemoryMirrorStore;
use dsync_core::memory::MemoryPrimaryStore;
use dsync_failure_log::FailureLogDir;
use dsync_failure_log::FailureLogWriter;
use dsync_failure_log::LogRole;
use dsync_failure_log::LogSegment;
use dsync_protocol::Document;
use dsync_protocol::FailureRecord;
use dsync_protocol::MirrorKind;
use dsync_protocol::OperationKind;
use dsync_state::MirrorRuntime;
use serde_json::json;
use tempfile::TempDir;

pub const VERSION: &str = "1.0.0";
pub const UNIT_PREFIX: &str = "u0";
pub const INDEX: &str = "u0_anon";

/// Both stores, the lock manager and the failure log of one test.
pub struct Harness {
    pub home: TempDir,
    pub log_dir: FailureLogDir,
    pub primary: Arc<MemoryPrimaryStore>,
    pub durable: Arc<dyn MirrorStore>,
    /// Set when the durable store is the in-memory one.
    pub memory_durable: Option<Arc<MemoryMirrorStore>>,
    /// Set when the durable store is SQLite.
    pub runtime: Option<Arc<MirrorRuntime>>,
    pub locks: Arc<MemoryLockManager>,
    pub failure_log: Arc<FailureLogWriter>,
    pub journal: Journal,
}

impl Harness {
    /// Durable store backed by SQLite in a temp directory.
    pub async fn sqlite() -> Self {
        let home = TempDir::new().expect("tempdir");
        let runtime = MirrorRuntime::init(dsync_state::mirror_db_path(home.path()))
            .await
            .expect("open durable store");
        let mut harness = Self::build(home, runtime.clone(), None);
        harness.runtime = Some(runtime);
        harness
    }

    /// Durable store kept in memory, recording into the shared journal.
    pub fn in_memory() -> Self {
        let home = TempDir::new().expect("tempdir");
        let journal = Journal::new();
        let durable = Arc::new(MemoryMirrorStore::new().with_journal(journal.clone()));
        let mut harness = Self::build(home, durable.clone(), Some(journal));
        harness.memory_durable = Some(durable);
        harness
    }

    fn build(home: TempDir, durable: Arc<dyn MirrorStore>, journal: Option<Journal>) -> Self {
        let journal = journal.unwrap_or_default();
        let log_dir = FailureLogDir::new(home.path().join("failure-log"), VERSION, true);
        std::fs::create_dir_all(log_dir.base()).expect("create failure log dir");
        let primary = Arc::new(MemoryPrimaryStore::new().with_journal(journal.clone()));
        primary.create_index_now(INDEX);
        let locks = Arc::new(MemoryLockManager::new().with_journal(journal.clone()));
        let failure_log = Arc::new(FailureLogWriter::new(log_dir.clone(), LogRole::Failure));
        Self {
            home,
            log_dir,
            primary,
            durable,
            memory_durable: None,
            runtime: None,
            locks,
            failure_log,
            journal,
        }
    }

    pub fn memory_durable(&self) -> &MemoryMirrorStore {
        self.memory_durable
            .as_deref()
            .expect("harness built with in_memory()")
    }

    pub fn mirror(&self) -> MirrorAccessor {
        MirrorAccessor::new(Arc::clone(&self.durable))
    }

    pub fn accessor(&self, index: &str) -> DataSourceAccessor {
        DataSourceAccessor::new(
            index,
            self.primary.clone(),
            Some(self.mirror()),
            Arc::clone(&self.failure_log),
        )
    }

    pub fn engine(&self) -> RepairEngine {
        self.engine_with_batch(1_000)
    }

    pub fn engine_with_batch(&self, records_per_batch: usize) -> RepairEngine {
        RepairEngine::new(
            UNIT_PREFIX,
            records_per_batch,
            self.log_dir.clone(),
            self.primary.clone(),
            self.mirror(),
            self.locks.clone(),
        )
    }

    /// Seeds the durable store directly, bypassing the write path.
    pub async fn seed_durable(&self, index: &str, doc: &Document) {
        let mirror = self.mirror();
        mirror
            .create_container(index)
            .await
            .expect("create container");
        mirror.create(index, doc).await.expect("seed durable store");
    }

    pub async fn durable_doc(&self, index: &str, kind: MirrorKind, id: &str) -> Option<Document> {
        let mut found = self
            .durable
            .search_by_ids(index, kind, &[id.to_string()])
            .await
            .expect("search durable store");
        assert!(found.len() <= 1, "duplicate durable records for {id}");
        found.pop()
    }

    /// Appends `records` to the failure log and rotates it so repair sees
    /// them.
    pub async fn log_failures(&self, records: &[FailureRecord]) -> LogSegment {
        let lines: Vec<String> = records
            .iter()
            .map(|record| record.to_line().expect("encode record"))
            .collect();
        self.log_lines(&lines).await
    }

    pub async fn log_lines(&self, lines: &[String]) -> LogSegment {
        for line in lines {
            self.failure_log
                .write_line(line)
                .await
                .expect("append failure line");
        }
        self.failure_log
            .rotate()
            .await
            .expect("rotate failure log")
            .expect("segment with records")
    }

    pub async fn pending_segments(&self) -> Vec<LogSegment> {
        self.log_dir
            .pending_segments()
            .await
            .expect("list pending segments")
    }

    /// Lines of every rotated segment with `role`, in segment order.
    pub async fn rotated_lines(&self, role: LogRole) -> Vec<String> {
        let status = self.log_dir.status().await.expect("failure log status");
        let mut lines = Vec::new();
        for file in status.rotated_with_role(role) {
            let contents = tokio::fs::read_to_string(&file.path)
                .await
                .expect("read rotated segment");
            lines.extend(contents.lines().map(str::to_string));
        }
        lines
    }
}

/// Entity owned by node `node`, with a non-empty static field.
pub fn entity(id: &str, node: &str, name: &str) -> Document {
    let mut doc = Document::new(id, "UserData");
    doc.cell_id = Some("cell1".to_string());
    doc.node_id = Some(node.to_string());
    doc.updated = 1_700_000_000_000;
    doc.source.insert("static".to_string(), json!({ "name": name }));
    doc
}

pub fn record(doc: &Document, operation: OperationKind, es_version: i64) -> FailureRecord {
    record_in(INDEX, doc, operation, es_version)
}

pub fn record_in(
    index: &str,
    doc: &Document,
    operation: OperationKind,
    es_version: i64,
) -> FailureRecord {
    FailureRecord {
        index_name: index.to_string(),
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
    }
}
