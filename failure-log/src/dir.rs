use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;
use tracing::info;

use crate::FailureLogError;
use crate::LogRole;
use crate::LogSegment;
use crate::Result;
use crate::SegmentClock;
use crate::SegmentId;
use crate::SegmentState;

/// The set of failure log files of one deployed version under a base
/// directory.
#[derive(Debug, Clone)]
pub struct FailureLogDir {
    base: PathBuf,
    version: String,
    physical_delete: bool,
    clock: Arc<SegmentClock>,
}

/// A segment found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub segment: LogSegment,
    pub path: PathBuf,
    pub len: u64,
}

/// Snapshot of what is left to repair.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FailureLogStatus {
    /// Rotated segments of every role, including error segments.
    pub rotated: Vec<SegmentFile>,
    /// Active failure segments, empty or not.
    pub active_failure: Vec<SegmentFile>,
    /// Active retry and error segments that hold at least one byte.
    pub active_retry_error: Vec<SegmentFile>,
    /// Segments kept after a logical delete.
    pub done: usize,
}

impl FailureLogStatus {
    pub fn is_fully_repaired(&self) -> bool {
        self.rotated.is_empty() && self.active_failure.is_empty() && self.active_retry_error.is_empty()
    }

    pub fn rotated_with_role(&self, role: LogRole) -> impl Iterator<Item = &SegmentFile> {
        self.rotated.iter().filter(move |file| file.segment.role == role)
    }
}

impl FailureLogDir {
    pub fn new(base: impl Into<PathBuf>, version: impl Into<String>, physical_delete: bool) -> Self {
        Self {
            base: base.into(),
            version: version.into(),
            physical_delete,
            clock: Arc::new(SegmentClock::default()),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn physical_delete(&self) -> bool {
        self.physical_delete
    }

    pub fn path_of(&self, segment: &LogSegment) -> PathBuf {
        self.base.join(segment.file_name(&self.version))
    }

    pub fn next_segment_id(&self) -> SegmentId {
        self.clock.next()
    }

    /// Fails with [`FailureLogError::MissingDir`] unless the base directory
    /// exists.
    pub async fn ensure_exists(&self) -> Result<()> {
        match fs::metadata(&self.base).await {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(FailureLogError::MissingDir(self.base.clone())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(FailureLogError::MissingDir(self.base.clone()))
            }
            Err(err) => Err(FailureLogError::io("inspect", &self.base)(err)),
        }
    }

    pub(crate) async fn create_if_missing(&self) -> Result<()> {
        fs::create_dir_all(&self.base)
            .await
            .map_err(FailureLogError::io("create", &self.base))
    }

    /// Lists every segment of this version, sorted by segment order. A
    /// missing base directory yields an empty list.
    pub async fn scan(&self) -> Result<Vec<SegmentFile>> {
        let mut entries = match fs::read_dir(&self.base).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(FailureLogError::io("list", &self.base)(err)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(FailureLogError::io("list", &self.base))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(segment) = LogSegment::from_file_name(&self.version, name) else {
                continue;
            };
            let path = entry.path();
            let len = entry
                .metadata()
                .await
                .map_err(FailureLogError::io("inspect", &path))?
                .len();
            self.clock.observe(segment.id);
            files.push(SegmentFile { segment, path, len });
        }
        files.sort_by_key(|file| file.segment);
        Ok(files)
    }

    /// Rotated failure and retry segments in the order repair drains them.
    /// Rotated error segments stay put until an operator requeues them.
    pub async fn pending_segments(&self) -> Result<Vec<LogSegment>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .map(|file| file.segment)
            .filter(|segment| {
                segment.state == SegmentState::Rotated && segment.role != LogRole::Error
            })
            .collect())
    }

    pub async fn status(&self) -> Result<FailureLogStatus> {
        let mut status = FailureLogStatus::default();
        for file in self.scan().await? {
            match (file.segment.state, file.segment.role) {
                (SegmentState::Rotated, _) => status.rotated.push(file),
                (SegmentState::Active, LogRole::Failure) => status.active_failure.push(file),
                (SegmentState::Active, _) if file.len > 0 => status.active_retry_error.push(file),
                (SegmentState::Active, _) => {}
                (SegmentState::Done, _) => status.done += 1,
            }
        }
        Ok(status)
    }

    /// Moves every rotated error segment back into the retry queue.
    pub async fn requeue_errors(&self) -> Result<Vec<LogSegment>> {
        let mut requeued = Vec::new();
        for file in self.scan().await? {
            let segment = file.segment;
            if segment.state != SegmentState::Rotated || segment.role != LogRole::Error {
                continue;
            }
            let target = LogSegment::new(segment.id, LogRole::Retry, SegmentState::Rotated);
            let target = self.rename_to_free(&file.path, target).await?;
            info!(
                "requeued {} as {}",
                file.path.display(),
                target.file_name(&self.version)
            );
            requeued.push(target);
        }
        Ok(requeued)
    }

    /// Renames `from` to the file name of `target`, bumping the id while a
    /// file of the same name already exists.
    pub(crate) async fn rename_to_free(&self, from: &Path, mut target: LogSegment) -> Result<LogSegment> {
        loop {
            let to = self.path_of(&target);
            let occupied = fs::try_exists(&to)
                .await
                .map_err(FailureLogError::io("inspect", &to))?;
            if !occupied {
                fs::rename(from, &to)
                    .await
                    .map_err(FailureLogError::io("rename", from))?;
                self.clock.observe(target.id);
                return Ok(target);
            }
            target.id = SegmentId::new(target.id.get() + 1);
        }
    }
}
