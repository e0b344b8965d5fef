use std::path::Path;
use std::path::PathBuf;

use tokio::fs;
use tokio::fs::File;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tracing::debug;

use crate::FailureLogDir;
use crate::FailureLogError;
use crate::LogSegment;
use crate::Result;
use crate::SegmentState;

/// One non-blank line of a rotated segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentLine {
    Text(String),
    /// Bytes that are not UTF-8, usually a final line cut short by a crash.
    Undecodable(Vec<u8>),
}

impl SegmentLine {
    /// The line as text, with undecodable bytes replaced by U+FFFD.
    pub fn to_text_lossy(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Undecodable(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// Streams the lines of a rotated segment in fixed-size batches.
pub struct RotatedLogReader {
    dir: FailureLogDir,
    segment: LogSegment,
    path: PathBuf,
    reader: BufReader<File>,
    buf: Vec<u8>,
    lines_read: u64,
}

impl RotatedLogReader {
    pub async fn open(dir: &FailureLogDir, segment: LogSegment) -> Result<Self> {
        let path = dir.path_of(&segment);
        let file = File::open(&path)
            .await
            .map_err(FailureLogError::io("open", &path))?;
        Ok(Self {
            dir: dir.clone(),
            segment,
            path,
            reader: BufReader::new(file),
            buf: Vec::new(),
            lines_read: 0,
        })
    }

    pub fn segment(&self) -> LogSegment {
        self.segment
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    /// Returns up to `limit` non-blank lines. An empty batch means the segment
    /// is exhausted.
    ///
    /// A line that is not UTF-8 does not fail the batch; it comes back as
    /// [`SegmentLine::Undecodable`].
    pub async fn read_batch(&mut self, limit: usize) -> Result<Vec<SegmentLine>> {
        let mut batch = Vec::with_capacity(limit.min(1024));
        while batch.len() < limit {
            self.buf.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(FailureLogError::io("read", &self.path))?;
            if read == 0 {
                break;
            }
            let bytes = trim_line_end(&self.buf);
            if bytes.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            self.lines_read += 1;
            let line = match std::str::from_utf8(bytes) {
                Ok(text) => SegmentLine::Text(text.to_string()),
                Err(_) => SegmentLine::Undecodable(bytes.to_vec()),
            };
            batch.push(line);
        }
        Ok(batch)
    }

    /// Removes the drained segment, or renames it aside when the directory
    /// uses logical deletes.
    pub async fn delete(self) -> Result<()> {
        let Self {
            dir, segment, path, ..
        } = self;
        if dir.physical_delete() {
            fs::remove_file(&path)
                .await
                .map_err(FailureLogError::io("remove", &path))?;
        } else {
            let done = dir.path_of(&segment.with_state(SegmentState::Done));
            fs::rename(&path, &done)
                .await
                .map_err(FailureLogError::io("rename", &path))?;
        }
        debug!("deleted drained log {}", path.display());
        Ok(())
    }

    /// Releases the file and leaves the segment in place for the next sweep.
    pub fn close(self) {
        debug!(
            "closed {} after {} lines without deleting it",
            self.path.display(),
            self.lines_read
        );
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
