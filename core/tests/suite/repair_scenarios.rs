use std::sync::Arc;
use std::time::Duration;

use dsync_core::Completion;
use dsync_core::RepairEngine;
use dsync_core::SqliteLockManager;
use dsync_protocol::Document;
use dsync_protocol::MirrorKind;
use dsync_protocol::OperationKind;
use dsync_test_support::Harness;
use dsync_test_support::INDEX;
use dsync_test_support::UNIT_PREFIX;
use dsync_test_support::entity;
use dsync_test_support::record;
use dsync_test_support::record_in;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn missing_durable_copy_is_created() {
    let harness = Harness::sqlite().await;
    let doc = entity("e1", "n1", "alice");
    harness.primary.put(INDEX, doc.clone(), 1);
    harness
        .log_failures(&[record(&doc, OperationKind::Create, 1)])
        .await;

    let report = harness.engine().sweep().await.expect("sweep");

    assert_eq!(report.completion, Completion::Complete);
    assert_eq!(report.stats.created, 1);
    assert_eq!(report.stats.segments_drained, 1);
    assert_eq!(
        harness.durable_doc(INDEX, MirrorKind::Entity, "e1").await,
        Some(doc.normalized())
    );
    assert!(harness.pending_segments().await.is_empty());
}

#[tokio::test]
async fn outdated_durable_copy_is_updated_at_captured_version() {
    let harness = Harness::sqlite().await;
    harness
        .seed_durable(INDEX, &entity("e1", "n1", "alice"))
        .await;
    let current = entity("e1", "n1", "bob");
    harness.primary.put(INDEX, current.clone(), 2);
    harness
        .log_failures(&[record(&current, OperationKind::Update, 2)])
        .await;

    let report = harness.engine().sweep().await.expect("sweep");

    assert_eq!(report.stats.updated, 1);
    assert_eq!(
        harness.durable_doc(INDEX, MirrorKind::Entity, "e1").await,
        Some(current.normalized())
    );
}

#[tokio::test]
async fn durable_copy_of_deleted_document_is_removed() {
    let harness = Harness::sqlite().await;
    let doc = entity("e1", "n1", "alice");
    harness.seed_durable(INDEX, &doc).await;
    harness
        .log_failures(&[record(&doc, OperationKind::Delete, 3)])
        .await;

    let report = harness.engine().sweep().await.expect("sweep");

    assert_eq!(report.stats.deleted, 1);
    assert_eq!(
        harness.durable_doc(INDEX, MirrorKind::Entity, "e1").await,
        None
    );
    assert_eq!(report.completion, Completion::Complete);
}

#[tokio::test]
async fn record_behind_primary_version_changes_nothing() {
    let harness = Harness::sqlite().await;
    let stored = entity("e1", "n1", "alice");
    harness.seed_durable(INDEX, &stored).await;
    let newer = entity("e1", "n1", "carol");
    harness.primary.put(INDEX, newer.clone(), 3);
    harness
        .log_failures(&[record(&newer, OperationKind::Update, 2)])
        .await;

    let report = harness.engine().sweep().await.expect("sweep");

    assert_eq!(report.stats.skipped, 1);
    assert_eq!(report.stats.updated, 0);
    assert_eq!(
        harness.durable_doc(INDEX, MirrorKind::Entity, "e1").await,
        Some(stored.normalized())
    );
    assert!(harness.pending_segments().await.is_empty());
}

#[tokio::test]
async fn cell_is_looked_up_in_the_administrative_index() {
    let harness = Harness::sqlite().await;
    let admin = format!("{UNIT_PREFIX}_ad");
    let mut cell = Document::new("cell1", "Cell");
    cell.source.insert("name".to_string(), json!("tenant"));
    harness.primary.put(&admin, cell.clone(), 1);
    harness
        .log_failures(&[record_in("u0_unit", &cell, OperationKind::Create, 1)])
        .await;

    let report = harness.engine().sweep().await.expect("sweep");

    assert_eq!(report.stats.created, 1);
    assert_eq!(
        harness.durable_doc("u0_unit", MirrorKind::Cell, "cell1").await,
        Some(cell.normalized())
    );
    assert_eq!(harness.locks.acquired(), 0);
}

#[tokio::test]
async fn dav_node_is_repaired_under_a_box_lease() {
    let harness = Harness::sqlite().await;
    let runtime = harness.runtime.clone().expect("sqlite harness");
    let mut node = Document::new("dav1", "Dav");
    node.box_id = Some("box1".to_string());
    node.source.insert("name".to_string(), json!("report.pdf"));
    harness.primary.put("u0_box", node.clone(), 1);
    harness
        .log_failures(&[record_in("u0_box", &node, OperationKind::Create, 1)])
        .await;

    let engine = RepairEngine::new(
        UNIT_PREFIX,
        10,
        harness.log_dir.clone(),
        harness.primary.clone(),
        harness.mirror(),
        Arc::new(SqliteLockManager::new(
            runtime.clone(),
            Duration::from_secs(30),
        )),
    );
    let report = engine.sweep().await.expect("sweep");

    assert_eq!(report.stats.created, 1);
    let stored = harness
        .durable_doc("u0_box", MirrorKind::DavNode, "dav1")
        .await
        .expect("dav node mirrored");
    assert_eq!(stored.source.get("children"), Some(&json!({})));
    assert_eq!(
        runtime.lock_lease("dav-box1").await.expect("read lease"),
        None
    );
}
