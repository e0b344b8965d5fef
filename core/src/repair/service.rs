use std::sync::Arc;
use std::time::Duration;

use dsync_failure_log::FailureLogWriter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::Completion;
use super::RepairEngine;
use crate::RepairError;

/// Background task running one repair sweep per interval.
///
/// Sweeps run back to back on one task and never overlap. Shutdown takes
/// effect between sweeps.
pub struct RepairService {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RepairService {
    /// Starts the task. When `failure_log` is given, its active segment is
    /// rotated once due before every sweep so fresh failures get repaired.
    pub fn spawn(
        engine: Arc<RepairEngine>,
        failure_log: Option<Arc<FailureLogWriter>>,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                run_once(&engine, failure_log.as_deref()).await;
            }
            debug!("repair service stopped");
        });
        Self { cancel, handle }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops scheduling sweeps and waits for the running one to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            warn!("repair service task failed: {err}");
        }
    }
}

async fn run_once(engine: &RepairEngine, failure_log: Option<&FailureLogWriter>) {
    if let Some(writer) = failure_log {
        match writer.rotate_if_due().await {
            Ok(Some(segment)) => debug!(segment = %segment.id, "rotated failure log for repair"),
            Ok(None) => {}
            Err(err) => warn!("failed to rotate failure log: {err}"),
        }
    }
    match engine.sweep().await {
        Ok(report) if report.completion == Completion::Complete => {
            debug!("durable store fully repaired");
        }
        Ok(report) => info!(
            "repair incomplete: {} retried, {} quarantined",
            report.stats.retried, report.stats.quarantined
        ),
        Err(RepairError::SweepInProgress) => debug!("previous repair sweep still running"),
        Err(err) => error!("repair sweep aborted: {err}"),
    }
}
