use dsync_core::AccessorError;
use dsync_core::Completion;
use dsync_core::PrimaryStoreError;
use dsync_core::memory::MirrorFault;
use dsync_failure_log::LogRole;
use dsync_protocol::Document;
use dsync_protocol::FailureRecord;
use dsync_protocol::MirrorKind;
use dsync_protocol::OperationKind;
use dsync_test_support::Harness;
use dsync_test_support::INDEX;
use dsync_test_support::entity;
use pretty_assertions::assert_eq;

async fn logged_records(harness: &Harness) -> Vec<FailureRecord> {
    harness
        .failure_log
        .rotate()
        .await
        .expect("rotate failure log");
    harness
        .rotated_lines(LogRole::Failure)
        .await
        .iter()
        .map(|line| FailureRecord::parse(line).expect("well-formed record"))
        .collect()
}

#[tokio::test]
async fn failed_mirror_write_is_logged_with_primary_version() {
    let harness = Harness::in_memory();
    let accessor = harness.accessor(INDEX);
    let doc = entity("e1", "n1", "alice");
    accessor.create(&doc).await.expect("create");

    harness.memory_durable().fail_next(MirrorFault::Other);
    let changed = entity("e1", "n1", "bob");
    let write = accessor
        .update(&changed, Some(1))
        .await
        .expect("update succeeds despite mirror failure");
    assert_eq!(write.version, 2);

    assert_eq!(
        logged_records(&harness).await,
        vec![FailureRecord {
            index_name: INDEX.to_string(),
            doc_type: "UserData".to_string(),
            lock_key: "odata-n1".to_string(),
            cell_id: "cell1".to_string(),
            uuid: "e1".to_string(),
            operation: OperationKind::Update,
            es_version: 2,
            updated: changed.updated,
        }]
    );
}

#[tokio::test]
async fn logged_failure_is_repaired_by_the_next_sweep() {
    let harness = Harness::in_memory();
    let accessor = harness.accessor(INDEX);
    harness.memory_durable().create_container_now(INDEX);
    harness.memory_durable().fail_next(MirrorFault::Connection);
    let doc = entity("e1", "n1", "alice");
    accessor.create(&doc).await.expect("create");
    harness
        .failure_log
        .rotate()
        .await
        .expect("rotate")
        .expect("one record logged");

    let report = harness.engine().sweep().await.expect("sweep");

    assert_eq!(report.stats.created, 1);
    assert_eq!(report.completion, Completion::Complete);
    assert_eq!(
        harness.memory_durable().get(INDEX, MirrorKind::Entity, "e1"),
        Some(doc.normalized())
    );
}

#[tokio::test]
async fn unreachable_durable_store_rejects_the_write() {
    let harness = Harness::in_memory();
    harness.memory_durable().set_unreachable(true);
    let err = harness
        .accessor(INDEX)
        .create(&entity("e1", "n1", "alice"))
        .await
        .expect_err("fail fast");

    assert!(matches!(err, AccessorError::MirrorUnavailable(_)));
    assert_eq!(harness.primary.get(INDEX, "e1"), None);
    assert_eq!(harness.failure_log.pending_records().await, 0);
}

#[tokio::test]
async fn missing_index_is_created_and_write_retried() {
    let harness = Harness::sqlite().await;
    let accessor = harness.accessor("u0_fresh");
    let doc = entity("e1", "n1", "alice");

    let write = accessor.create(&doc).await.expect("create");

    assert_eq!(write.version, 1);
    assert!(harness.primary.index_exists("u0_fresh"));
    assert_eq!(
        harness
            .durable_doc("u0_fresh", MirrorKind::Entity, "e1")
            .await,
        Some(doc.normalized())
    );
}

#[tokio::test]
async fn primary_failures_propagate_without_logging() {
    let harness = Harness::in_memory();
    harness
        .primary
        .fail_next(PrimaryStoreError::NoResponse("timed out".to_string()));

    let err = harness
        .accessor(INDEX)
        .create(&entity("e1", "n1", "alice"))
        .await
        .expect_err("primary failure");

    assert!(matches!(
        err,
        AccessorError::Primary(PrimaryStoreError::NoResponse(_))
    ));
    assert_eq!(harness.failure_log.pending_records().await, 0);
}

#[tokio::test]
async fn failed_bulk_mirror_logs_every_item() {
    let harness = Harness::in_memory();
    let accessor = harness.accessor(INDEX);
    harness.memory_durable().create_container_now(INDEX);
    let docs = vec![entity("e1", "n1", "a"), entity("e2", "n2", "b")];
    harness.memory_durable().fail_next(MirrorFault::Other);

    let writes = accessor.bulk_create(&docs).await.expect("bulk create");
    assert_eq!(writes.len(), 2);

    let logged = logged_records(&harness).await;
    let summary: Vec<(&str, &str, OperationKind, i64)> = logged
        .iter()
        .map(|record| {
            (
                record.uuid.as_str(),
                record.lock_key.as_str(),
                record.operation,
                record.es_version,
            )
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            ("e1", "odata-n1", OperationKind::Create, 1),
            ("e2", "odata-n2", OperationKind::Create, 1),
        ]
    );
    assert!(harness.memory_durable().is_empty());
}

#[tokio::test]
async fn bulk_update_creates_links_in_one_transaction() {
    let harness = Harness::sqlite().await;
    let accessor = harness.accessor(INDEX);
    let left = entity("e1", "n1", "a");
    let right = entity("e2", "n1", "b");
    accessor
        .bulk_create(&[left.clone(), right.clone()])
        .await
        .expect("bulk create");

    let mut link = Document::new("l1", "Link");
    link.node_id = Some("n1".to_string());
    let updated_left = entity("e1", "n1", "a2");
    let writes = accessor
        .bulk_update_with_links(std::slice::from_ref(&updated_left), std::slice::from_ref(&link))
        .await
        .expect("bulk update");

    assert_eq!(writes[0].version, 2);
    assert_eq!(
        harness.durable_doc(INDEX, MirrorKind::Link, "l1").await,
        Some(link.normalized())
    );
    assert_eq!(
        harness.durable_doc(INDEX, MirrorKind::Entity, "e1").await,
        Some(updated_left.normalized())
    );
}

#[tokio::test]
async fn failed_cell_deletion_mark_is_quarantined_by_repair() {
    let harness = Harness::in_memory();
    let accessor = harness.accessor(INDEX);
    harness.memory_durable().fail_next(MirrorFault::Other);

    accessor
        .cell_bulk_deletion("cell1", "u0_ad")
        .await
        .expect("deletion mark");
    let logged = logged_records(&harness).await;
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].operation, OperationKind::CascadeDeleteMark);
    assert_eq!(logged[0].lock_key, "");

    let report = harness.engine().sweep().await.expect("sweep");
    assert_eq!(report.stats.quarantined, 1);
    assert_eq!(report.completion, Completion::Partial);
}

#[tokio::test]
async fn delete_removes_both_copies() {
    let harness = Harness::sqlite().await;
    let accessor = harness.accessor(INDEX);
    let doc = entity("e1", "n1", "alice");
    accessor.create(&doc).await.expect("create");

    let write = accessor
        .delete(&doc, Some(1))
        .await
        .expect("delete")
        .expect("index exists");

    assert_eq!(write.version, 2);
    assert_eq!(harness.primary.get(INDEX, "e1"), None);
    assert_eq!(
        harness.durable_doc(INDEX, MirrorKind::Entity, "e1").await,
        None
    );
}
