use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use dsync_protocol::Document;
use uuid::Uuid;

use super::MirrorRuntime;

pub(super) fn unique_temp_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    std::env::temp_dir().join(format!(
        "dsync-state-runtime-test-{nanos}-{}",
        Uuid::new_v4()
    ))
}

pub(super) async fn open_runtime() -> (Arc<MirrorRuntime>, PathBuf) {
    let dir = unique_temp_dir();
    let runtime = MirrorRuntime::init(super::mirror_db_path(&dir))
        .await
        .expect("initialize runtime");
    (runtime, dir)
}

pub(super) fn document(id: &str, doc_type: &str) -> Document {
    let mut doc = Document::new(id, doc_type);
    doc.cell_id = Some("cell1".to_string());
    doc.node_id = Some("node1".to_string());
    doc.published = 1_700_000_000_000;
    doc.updated = 1_700_000_000_000;
    doc
}
