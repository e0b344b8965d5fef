use dsync_core::Completion;
use dsync_core::RepairError;
use dsync_core::StoreSide;
use dsync_failure_log::FailureLogDir;
use dsync_failure_log::LogRole;
use dsync_failure_log::LogSegment;
use dsync_failure_log::SegmentId;
use dsync_failure_log::SegmentState;
use dsync_protocol::FailureRecord;
use dsync_protocol::LockKey;
use dsync_protocol::MirrorKind;
use dsync_protocol::OperationKind;
use dsync_test_support::Harness;
use dsync_test_support::INDEX;
use dsync_test_support::UNIT_PREFIX;
use dsync_test_support::entity;
use dsync_test_support::record;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn repeated_failures_of_one_document_are_repaired_once() {
    let harness = Harness::sqlite().await;
    let first = entity("e1", "n1", "alice");
    let latest = entity("e1", "n1", "bob");
    harness.primary.put(INDEX, latest.clone(), 2);
    harness
        .log_failures(&[
            record(&first, OperationKind::Create, 1),
            record(&latest, OperationKind::Update, 2),
        ])
        .await;

    let report = harness.engine().sweep().await.expect("sweep");

    assert_eq!(report.stats.records_read, 2);
    assert_eq!(report.stats.created, 1);
    assert_eq!(report.stats.updated, 0);
    assert_eq!(harness.locks.acquired(), 1);
    assert_eq!(
        harness.durable_doc(INDEX, MirrorKind::Entity, "e1").await,
        Some(latest.normalized())
    );
}

#[tokio::test]
async fn replaying_a_repaired_log_is_a_no_op() {
    let harness = Harness::sqlite().await;
    let doc = entity("e1", "n1", "alice");
    harness.primary.put(INDEX, doc.clone(), 1);
    let records = [
        record(&doc, OperationKind::Create, 1),
        record(&entity("e2", "n1", "ghost"), OperationKind::Delete, 2),
    ];

    harness.log_failures(&records).await;
    let first = harness.engine().sweep().await.expect("first sweep");
    assert_eq!(first.stats.created, 1);

    harness.log_failures(&records).await;
    let second = harness.engine().sweep().await.expect("second sweep");
    assert_eq!(second.stats.created, 0);
    assert_eq!(second.stats.deleted, 0);
    assert_eq!(second.stats.skipped, 2);
    assert_eq!(second.completion, Completion::Complete);
    assert_eq!(
        harness.durable_doc(INDEX, MirrorKind::Entity, "e1").await,
        Some(doc.normalized())
    );
}

#[tokio::test]
async fn stores_are_read_and_written_only_under_the_lock() {
    let harness = Harness::in_memory();
    let doc = entity("e1", "n1", "alice");
    harness.primary.put(INDEX, doc.clone(), 1);
    harness.memory_durable().create_container_now(INDEX);
    harness
        .log_failures(&[record(&doc, OperationKind::Create, 1)])
        .await;
    harness.journal.clear();

    harness.engine().sweep().await.expect("sweep");

    assert_eq!(
        harness.journal.entries(),
        vec![
            "lock odata-n1".to_string(),
            format!("primary.search {INDEX}/e1"),
            format!("mirror.search {INDEX}/e1"),
            format!("mirror.insert {INDEX}/e1"),
            "unlock odata-n1".to_string(),
        ]
    );
}

#[tokio::test]
async fn contended_lock_defers_record_to_the_next_sweep() {
    let harness = Harness::sqlite().await;
    let doc = entity("e1", "n1", "alice");
    harness.primary.put(INDEX, doc.clone(), 1);
    harness
        .log_failures(&[record(&doc, OperationKind::Create, 1)])
        .await;
    let key = LockKey::odata("n1");
    harness.locks.hold_elsewhere(key.clone());

    let deferred = harness.engine().sweep().await.expect("sweep");
    assert_eq!(deferred.stats.retried, 1);
    assert_eq!(deferred.completion, Completion::Partial);
    assert_eq!(harness.rotated_lines(LogRole::Retry).await.len(), 1);
    assert_eq!(
        harness.durable_doc(INDEX, MirrorKind::Entity, "e1").await,
        None
    );

    harness.locks.release_elsewhere(&key);
    let repaired = harness.engine().sweep().await.expect("retry sweep");
    assert_eq!(repaired.stats.created, 1);
    assert_eq!(repaired.completion, Completion::Complete);
}

#[tokio::test]
async fn lapsed_lock_defers_the_write_to_the_next_sweep() {
    let harness = Harness::sqlite().await;
    let doc = entity("e1", "n1", "alice");
    harness.primary.put(INDEX, doc.clone(), 1);
    harness
        .log_failures(&[record(&doc, OperationKind::Create, 1)])
        .await;
    harness.locks.set_lapse(true);

    let deferred = harness.engine().sweep().await.expect("sweep");
    assert_eq!(deferred.stats.retried, 1);
    assert_eq!(deferred.stats.created, 0);
    assert_eq!(harness.locks.acquired(), harness.locks.released());
    assert_eq!(
        harness.durable_doc(INDEX, MirrorKind::Entity, "e1").await,
        None
    );

    harness.locks.set_lapse(false);
    let repaired = harness.engine().sweep().await.expect("retry sweep");
    assert_eq!(repaired.stats.created, 1);
    assert_eq!(repaired.completion, Completion::Complete);
}

#[tokio::test]
async fn unrepairable_records_go_to_the_error_log() {
    let harness = Harness::sqlite().await;
    let mut bad_lock = record(&entity("e1", "n1", "alice"), OperationKind::Create, 1);
    bad_lock.lock_key = "box-1".to_string();
    let cascade = FailureRecord {
        index_name: format!("{UNIT_PREFIX}_ad"),
        doc_type: "Cell".to_string(),
        lock_key: String::new(),
        cell_id: "cell1".to_string(),
        uuid: "cell1".to_string(),
        operation: OperationKind::CascadeDeleteMark,
        es_version: dsync_protocol::NO_VERSION,
        updated: 0,
    };
    harness
        .log_lines(&[
            "not a failure record".to_string(),
            cascade.to_line().expect("encode"),
            bad_lock.to_line().expect("encode"),
        ])
        .await;

    let report = harness.engine().sweep().await.expect("sweep");

    assert_eq!(report.stats.quarantined, 3);
    assert_eq!(report.completion, Completion::Partial);
    let errors = harness.rotated_lines(LogRole::Error).await;
    assert_eq!(
        errors,
        vec![
            "not a failure record".to_string(),
            cascade.to_string(),
            bad_lock.to_string(),
        ]
    );
    assert!(harness.pending_segments().await.is_empty());

    let status = harness.log_dir.status().await.expect("status");
    assert_eq!(status.rotated_with_role(LogRole::Error).count(), 1);
}

#[tokio::test]
async fn line_cut_short_by_a_crash_is_quarantined() {
    let harness = Harness::sqlite().await;
    let doc = entity("e1", "n1", "alice");
    harness.primary.put(INDEX, doc.clone(), 1);
    let good = record(&doc, OperationKind::Create, 1).to_string();
    let cut = record(&entity("e2", "n2", "bob"), OperationKind::Create, 1).to_string();
    let mut contents = format!("{good}\n{cut}").into_bytes();
    contents.push(0xC3);
    let segment = LogSegment::new(SegmentId::new(1), LogRole::Failure, SegmentState::Rotated);
    tokio::fs::write(harness.log_dir.path_of(&segment), contents)
        .await
        .expect("write segment");

    let report = harness.engine().sweep().await.expect("sweep");

    assert_eq!(report.stats.created, 1);
    assert_eq!(report.stats.quarantined, 1);
    assert_eq!(report.stats.segments_drained, 1);
    assert_eq!(report.stats.segments_skipped, 0);
    assert!(harness.pending_segments().await.is_empty());
    assert_eq!(
        harness.rotated_lines(LogRole::Error).await,
        vec![format!("{cut}\u{FFFD}")]
    );
    assert_eq!(
        harness.durable_doc(INDEX, MirrorKind::Entity, "e1").await,
        Some(doc.normalized())
    );
}

#[tokio::test]
async fn refused_lock_quarantines_the_record() {
    let harness = Harness::sqlite().await;
    let doc = entity("e1", "n1", "alice");
    harness.primary.put(INDEX, doc.clone(), 1);
    harness
        .log_failures(&[record(&doc, OperationKind::Create, 1)])
        .await;
    harness.locks.set_refuse(true);

    let report = harness.engine().sweep().await.expect("sweep");

    assert_eq!(report.stats.quarantined, 1);
    assert_eq!(harness.rotated_lines(LogRole::Error).await.len(), 1);
}

#[tokio::test]
async fn duplicate_primary_hits_abort_and_keep_the_segment() {
    let harness = Harness::sqlite().await;
    let doc = entity("e1", "n1", "alice");
    harness.primary.put(INDEX, doc.clone(), 1);
    harness.primary.duplicate_hits("e1");
    let segment = harness
        .log_failures(&[record(&doc, OperationKind::Create, 1)])
        .await;

    let err = harness.engine().sweep().await.expect_err("fatal");

    assert!(matches!(
        err,
        RepairError::MultipleHits {
            store: StoreSide::Primary,
            count: 2,
            ..
        }
    ));
    assert_eq!(harness.pending_segments().await, vec![segment]);
    assert_eq!(harness.locks.acquired(), harness.locks.released());
    let status = harness.log_dir.status().await.expect("status");
    assert!(status.active_retry_error.is_empty());
}

#[tokio::test]
async fn duplicate_primary_hit_beyond_the_page_aborts() {
    let harness = Harness::in_memory();
    let doc = entity("e1", "n1", "alice");
    harness.primary.put(INDEX, doc.clone(), 1);
    harness.primary.duplicate_off_page("e1");
    let segment = harness
        .log_failures(&[record(&doc, OperationKind::Create, 1)])
        .await;

    let err = harness.engine().sweep().await.expect_err("fatal");

    assert!(matches!(
        err,
        RepairError::MultipleHits {
            store: StoreSide::Primary,
            count: 2,
            ..
        }
    ));
    assert_eq!(harness.pending_segments().await, vec![segment]);
    assert_eq!(harness.memory_durable().get(INDEX, MirrorKind::Entity, "e1"), None);
}

#[tokio::test]
async fn duplicate_durable_hits_abort_the_sweep() {
    let harness = Harness::in_memory();
    let doc = entity("e1", "n1", "alice");
    harness.primary.put(INDEX, doc.clone(), 1);
    harness.memory_durable().put(INDEX, doc.clone());
    harness.memory_durable().duplicate_hits("e1");
    let segment = harness
        .log_failures(&[record(&doc, OperationKind::Update, 1)])
        .await;

    let err = harness.engine().sweep().await.expect_err("fatal");

    assert!(matches!(
        err,
        RepairError::MultipleHits {
            store: StoreSide::Durable,
            ..
        }
    ));
    assert_eq!(harness.pending_segments().await, vec![segment]);
    assert_eq!(harness.locks.held(), 0);
}

#[tokio::test]
async fn broken_lock_manager_aborts_the_sweep() {
    let harness = Harness::sqlite().await;
    let doc = entity("e1", "n1", "alice");
    let segment = harness
        .log_failures(&[record(&doc, OperationKind::Create, 1)])
        .await;
    harness.locks.set_state_error(true);

    let err = harness.engine().sweep().await.expect_err("fatal");

    assert!(matches!(err, RepairError::Lock(_)));
    assert_eq!(harness.pending_segments().await, vec![segment]);
}

#[tokio::test]
async fn unreachable_durable_store_consumes_nothing() {
    let harness = Harness::in_memory();
    let doc = entity("e1", "n1", "alice");
    let segment = harness
        .log_failures(&[record(&doc, OperationKind::Create, 1)])
        .await;
    harness.memory_durable().set_unreachable(true);

    let err = harness.engine().sweep().await.expect_err("fatal");

    assert!(matches!(err, RepairError::Mirror(ref inner) if inner.is_connection()));
    assert_eq!(harness.pending_segments().await, vec![segment]);
}

#[tokio::test]
async fn missing_log_directory_is_a_configuration_error() {
    let harness = Harness::sqlite().await;
    let missing = FailureLogDir::new(harness.home.path().join("nowhere"), "1.0.0", true);
    let engine = dsync_core::RepairEngine::new(
        UNIT_PREFIX,
        10,
        missing,
        harness.primary.clone(),
        harness.mirror(),
        harness.locks.clone(),
    );

    let err = engine.sweep().await.expect_err("missing dir");
    assert!(matches!(err, RepairError::Config(_)));
}

#[tokio::test]
async fn segments_are_read_in_batches_until_drained() {
    let harness = Harness::sqlite().await;
    let records: Vec<FailureRecord> = (0..5)
        .map(|i| {
            let doc = entity(&format!("e{i}"), "n1", "batch");
            harness.primary.put(INDEX, doc.clone(), 1);
            record(&doc, OperationKind::Create, 1)
        })
        .collect();
    harness.log_failures(&records).await;

    let report = harness.engine_with_batch(2).sweep().await.expect("sweep");

    assert_eq!(report.stats.records_read, 5);
    assert_eq!(report.stats.created, 5);
    assert_eq!(report.completion, Completion::Complete);
}

#[tokio::test]
async fn requeued_errors_are_replayed() {
    let harness = Harness::sqlite().await;
    let doc = entity("e1", "n1", "alice");
    harness.primary.put(INDEX, doc.clone(), 1);
    harness
        .log_failures(&[record(&doc, OperationKind::Create, 1)])
        .await;
    harness.locks.set_refuse(true);
    let quarantined = harness.engine().sweep().await.expect("sweep");
    assert_eq!(quarantined.stats.quarantined, 1);

    harness.locks.set_refuse(false);
    let requeued = harness.log_dir.requeue_errors().await.expect("requeue");
    assert_eq!(requeued.len(), 1);
    let repaired = harness.engine().sweep().await.expect("replay");

    assert_eq!(repaired.stats.created, 1);
    assert_eq!(repaired.completion, Completion::Complete);
}
