//! Replays the failure log against both stores until the durable store
//! agrees with the primary store.
//!
//! A sweep reads every rotated failure and retry segment in segment order,
//! collapses repeated records of one document, and reconciles each record
//! under its resource lock. Records that may succeed later go to the retry
//! log; records that never will go to the error log. A segment is deleted
//! only once it was read to the end.

mod dedup;
mod reconcile;
mod service;

use std::sync::Arc;

use dsync_failure_log::FailureLogDir;
use dsync_failure_log::FailureLogWriter;
use dsync_failure_log::LogRole;
use dsync_failure_log::LogSegment;
use dsync_failure_log::RotatedLogReader;
use dsync_failure_log::SegmentLine;
use dsync_protocol::FailureRecord;
use dsync_protocol::OperationKind;
use tokio::sync::Mutex;
use tracing::info;
use tracing::warn;

pub use reconcile::ReconcileAction;
pub use reconcile::SkipReason;
pub use reconcile::decide;
pub use service::RepairService;

use crate::LockManager;
use crate::MirrorAccessor;
use crate::PrimaryStore;
use crate::RepairError;
use crate::config::Config;
use dedup::dedup_and_group;
use reconcile::Outcome;
use reconcile::Sinks;

/// Per-sweep counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Segments read to the end and deleted.
    pub segments_drained: u64,
    /// Segments left in place after a read failure.
    pub segments_skipped: u64,
    pub records_read: u64,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub retried: u64,
    pub quarantined: u64,
}

impl SweepStats {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Applied(ReconcileAction::Create) => self.created += 1,
            Outcome::Applied(ReconcileAction::Update) => self.updated += 1,
            Outcome::Applied(ReconcileAction::Delete) => self.deleted += 1,
            Outcome::Applied(ReconcileAction::Skip(_)) => self.skipped += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::Quarantined => self.quarantined += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// No failure, retry or error records remain anywhere in the log.
    Complete,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub stats: SweepStats,
    pub completion: Completion,
}

pub struct RepairEngine {
    unit_prefix: String,
    records_per_batch: usize,
    log_dir: FailureLogDir,
    primary: Arc<dyn PrimaryStore>,
    mirror: MirrorAccessor,
    locks: Arc<dyn LockManager>,
    sweep_guard: Mutex<()>,
}

impl RepairEngine {
    pub fn new(
        unit_prefix: impl Into<String>,
        records_per_batch: usize,
        log_dir: FailureLogDir,
        primary: Arc<dyn PrimaryStore>,
        mirror: MirrorAccessor,
        locks: Arc<dyn LockManager>,
    ) -> Self {
        Self {
            unit_prefix: unit_prefix.into(),
            records_per_batch: records_per_batch.max(1),
            log_dir,
            primary,
            mirror,
            locks,
            sweep_guard: Mutex::new(()),
        }
    }

    pub fn from_config(
        config: &Config,
        primary: Arc<dyn PrimaryStore>,
        mirror: MirrorAccessor,
        locks: Arc<dyn LockManager>,
    ) -> Self {
        Self::new(
            config.unit_prefix.clone(),
            config.failure_log.records_per_batch,
            config.failure_log_dir(),
            primary,
            mirror,
            locks,
        )
    }

    pub fn log_dir(&self) -> &FailureLogDir {
        &self.log_dir
    }

    /// Runs one sweep over every pending segment.
    ///
    /// A fatal error stops the sweep and leaves the segment being read in
    /// place; the retry and error logs are rotated either way.
    pub async fn sweep(&self) -> Result<SweepReport, RepairError> {
        let Ok(_running) = self.sweep_guard.try_lock() else {
            return Err(RepairError::SweepInProgress);
        };
        self.log_dir.ensure_exists().await?;
        self.mirror
            .check_connection()
            .await
            .map_err(RepairError::Mirror)?;

        let retry = FailureLogWriter::new(self.log_dir.clone(), LogRole::Retry);
        let error = FailureLogWriter::new(self.log_dir.clone(), LogRole::Error);
        retry.recover().await?;
        error.recover().await?;
        let sinks = Sinks {
            retry: &retry,
            error: &error,
        };

        let mut stats = SweepStats::default();
        let drained = self.drain(&sinks, &mut stats).await;
        let rotated = rotate_sinks(&sinks).await;
        drained?;
        rotated?;

        let status = self.log_dir.status().await?;
        let completion = if status.is_fully_repaired() {
            Completion::Complete
        } else {
            Completion::Partial
        };
        info!(
            "repair sweep finished ({completion:?}): {} segments drained, {} records read, {} created, {} updated, {} deleted, {} skipped, {} retried, {} quarantined",
            stats.segments_drained,
            stats.records_read,
            stats.created,
            stats.updated,
            stats.deleted,
            stats.skipped,
            stats.retried,
            stats.quarantined
        );
        Ok(SweepReport { stats, completion })
    }

    async fn drain(&self, sinks: &Sinks<'_>, stats: &mut SweepStats) -> Result<(), RepairError> {
        for segment in self.log_dir.pending_segments().await? {
            sinks.retry.open_active(segment.id).await?;
            sinks.error.open_active(segment.id).await?;
            self.drain_segment(segment, sinks, stats).await?;
        }
        Ok(())
    }

    async fn drain_segment(
        &self,
        segment: LogSegment,
        sinks: &Sinks<'_>,
        stats: &mut SweepStats,
    ) -> Result<(), RepairError> {
        let mut reader = match RotatedLogReader::open(&self.log_dir, segment).await {
            Ok(reader) => reader,
            Err(err) => {
                warn!(segment = %segment.id, "skipping unreadable segment: {err}");
                stats.segments_skipped += 1;
                return Ok(());
            }
        };
        loop {
            let lines = match reader.read_batch(self.records_per_batch).await {
                Ok(lines) => lines,
                Err(err) => {
                    warn!(
                        segment = %segment.id,
                        "read failed after {} lines, keeping segment: {err}",
                        reader.lines_read()
                    );
                    reader.close();
                    stats.segments_skipped += 1;
                    return Ok(());
                }
            };
            if lines.is_empty() {
                break;
            }
            stats.records_read += lines.len() as u64;
            let records = parse_batch(lines, sinks, stats).await?;
            for group in dedup_and_group(records) {
                for record in &group {
                    let outcome = self.reconcile(record, sinks).await?;
                    stats.record(&outcome);
                }
            }
        }

        let path = reader.path().to_path_buf();
        match reader.delete().await {
            Ok(()) => {
                info!(segment = %segment.id, "drained {}", path.display());
                stats.segments_drained += 1;
            }
            Err(err) => warn!(segment = %segment.id, "failed to delete drained segment: {err}"),
        }
        Ok(())
    }
}

/// Parses a batch, moving malformed lines and records repair cannot replay
/// to the error log.
async fn parse_batch(
    lines: Vec<SegmentLine>,
    sinks: &Sinks<'_>,
    stats: &mut SweepStats,
) -> Result<Vec<FailureRecord>, RepairError> {
    let mut records = Vec::with_capacity(lines.len());
    for line in lines {
        let text = match line {
            SegmentLine::Text(text) => text,
            SegmentLine::Undecodable(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                warn!("failure record is not UTF-8 {text:?}");
                sinks.error.write_line(&text).await?;
                stats.quarantined += 1;
                continue;
            }
        };
        match FailureRecord::parse(&text) {
            Ok(record) if record.operation == OperationKind::CascadeDeleteMark => {
                warn!(
                    uuid = %record.uuid,
                    "cascading cell deletion cannot be repaired automatically"
                );
                sinks.error.write_record(&record).await?;
                stats.quarantined += 1;
            }
            Ok(record) => records.push(record),
            Err(err) => {
                warn!("malformed failure record {text:?}: {err}");
                sinks.error.write_line(&text).await?;
                stats.quarantined += 1;
            }
        }
    }
    Ok(records)
}

async fn rotate_sinks(sinks: &Sinks<'_>) -> Result<(), RepairError> {
    let retry = sinks.retry.rotate().await;
    let error = sinks.error.rotate().await;
    for rotated in [&retry, &error] {
        if let Ok(Some(segment)) = rotated {
            info!(segment = %segment.id, "rotated {} log", segment.role.as_str());
        }
    }
    retry?;
    error?;
    Ok(())
}
