use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use dsync_protocol::FailureRecord;
use tokio::fs;
use tokio::fs::File;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::FailureLogDir;
use crate::FailureLogError;
use crate::LogRole;
use crate::LogSegment;
use crate::Result;
use crate::SegmentId;
use crate::SegmentState;

struct ActiveSegment {
    segment: LogSegment,
    path: PathBuf,
    file: File,
    opened_at: Instant,
    records: u64,
}

/// Appends lines to the active segment of one role and rotates it.
///
/// Appends and rotation share one lock, so an append that starts after
/// [`FailureLogWriter::rotate`] returned always lands in a new segment. The
/// next active segment is opened lazily by the first append after a rotation.
pub struct FailureLogWriter {
    dir: FailureLogDir,
    role: LogRole,
    rotation_interval: Option<Duration>,
    active: Mutex<Option<ActiveSegment>>,
}

impl FailureLogWriter {
    pub fn new(dir: FailureLogDir, role: LogRole) -> Self {
        Self {
            dir,
            role,
            rotation_interval: None,
            active: Mutex::new(None),
        }
    }

    /// Rotate the active segment once it has been open for `interval`.
    pub fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = Some(interval);
        self
    }

    pub fn dir(&self) -> &FailureLogDir {
        &self.dir
    }

    pub fn role(&self) -> LogRole {
        self.role
    }

    /// Rotates active segments of this role left behind by an earlier process.
    /// Empty leftovers are removed.
    pub async fn recover(&self) -> Result<Vec<LogSegment>> {
        let guard = self.active.lock().await;
        let open = guard.as_ref().map(|active| active.segment);
        let mut recovered = Vec::new();
        for file in self.dir.scan().await? {
            let segment = file.segment;
            if segment.role != self.role
                || segment.state != SegmentState::Active
                || Some(segment) == open
            {
                continue;
            }
            if file.len == 0 {
                fs::remove_file(&file.path)
                    .await
                    .map_err(FailureLogError::io("remove", &file.path))?;
                continue;
            }
            let rotated = self
                .dir
                .rename_to_free(&file.path, segment.with_state(SegmentState::Rotated))
                .await?;
            warn!(
                "rotated leftover {} log {}",
                self.role.as_str(),
                file.path.display()
            );
            recovered.push(rotated);
        }
        Ok(recovered)
    }

    /// Opens the active segment `id` unless a segment is already open.
    pub async fn open_active(&self, id: SegmentId) -> Result<()> {
        let mut guard = self.active.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_segment(id).await?);
        }
        Ok(())
    }

    pub async fn write_record(&self, record: &FailureRecord) -> Result<()> {
        let line = record.to_line()?;
        self.write_line(&line).await
    }

    /// Appends `line` plus a newline with a single write, then syncs.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.active.lock().await;
        if self.is_due(guard.as_ref()) {
            self.rotate_locked(&mut guard).await?;
        }
        let active = match guard.take() {
            Some(active) => active,
            None => self.open_segment(self.dir.next_segment_id()).await?,
        };
        let active = guard.insert(active);

        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        active
            .file
            .write_all(buf.as_bytes())
            .await
            .map_err(FailureLogError::io("append to", &active.path))?;
        active
            .file
            .sync_data()
            .await
            .map_err(FailureLogError::io("sync", &active.path))?;
        active.records += 1;
        Ok(())
    }

    /// Closes the active segment and makes it visible to repair. Returns
    /// `None` when nothing was open or the segment held no records.
    pub async fn rotate(&self) -> Result<Option<LogSegment>> {
        let mut guard = self.active.lock().await;
        self.rotate_locked(&mut guard).await
    }

    pub async fn rotate_if_due(&self) -> Result<Option<LogSegment>> {
        let mut guard = self.active.lock().await;
        if self.is_due(guard.as_ref()) {
            self.rotate_locked(&mut guard).await
        } else {
            Ok(None)
        }
    }

    pub async fn active_segment(&self) -> Option<LogSegment> {
        self.active.lock().await.as_ref().map(|active| active.segment)
    }

    /// Records appended to the active segment by this writer.
    pub async fn pending_records(&self) -> u64 {
        self.active
            .lock()
            .await
            .as_ref()
            .map_or(0, |active| active.records)
    }

    fn is_due(&self, active: Option<&ActiveSegment>) -> bool {
        match (self.rotation_interval, active) {
            (Some(interval), Some(active)) => active.opened_at.elapsed() >= interval,
            _ => false,
        }
    }

    async fn open_segment(&self, id: SegmentId) -> Result<ActiveSegment> {
        self.dir.create_if_missing().await?;
        let segment = LogSegment::new(id, self.role, SegmentState::Active);
        let path = self.dir.path_of(&segment);
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
            .map_err(FailureLogError::io("open", &path))?;
        debug!("opened {} log {}", self.role.as_str(), path.display());
        Ok(ActiveSegment {
            segment,
            path,
            file,
            opened_at: Instant::now(),
            records: 0,
        })
    }

    async fn rotate_locked(&self, guard: &mut Option<ActiveSegment>) -> Result<Option<LogSegment>> {
        let Some(active) = guard.take() else {
            return Ok(None);
        };
        let ActiveSegment {
            segment,
            path,
            file,
            records,
            ..
        } = active;
        drop(file);

        if records == 0 {
            let len = fs::metadata(&path)
                .await
                .map_err(FailureLogError::io("inspect", &path))?
                .len();
            if len == 0 {
                fs::remove_file(&path)
                    .await
                    .map_err(FailureLogError::io("remove", &path))?;
                return Ok(None);
            }
        }

        let rotated = self
            .dir
            .rename_to_free(&path, segment.with_state(SegmentState::Rotated))
            .await?;
        debug!(
            "rotated {} log {} ({records} records)",
            self.role.as_str(),
            path.display()
        );
        Ok(Some(rotated))
    }
}
