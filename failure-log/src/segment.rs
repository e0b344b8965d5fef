use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

const FILE_PREFIX: &str = "adsWriteFailure_";
const DONE_SUFFIX: &str = ".done";

/// Monotonic identifier of a log segment, derived from the wall clock in
/// milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(u64);

impl SegmentId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which of the three sibling logs a segment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogRole {
    /// Written by the write path when a mirror write fails.
    Failure,
    /// Records repair could not process because their lock was busy.
    Retry,
    /// Records that need an operator.
    Error,
}

impl LogRole {
    fn suffix(self) -> &'static str {
        match self {
            Self::Failure => "",
            Self::Retry => ".retry",
            Self::Error => ".error",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Failure => "failure",
            Self::Retry => "retry",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SegmentState {
    /// Still open for appends.
    Active,
    /// Closed and waiting to be drained.
    Rotated,
    /// Drained and kept on disk because logical delete is configured.
    Done,
}

/// A single log file, identified without relying on its name.
///
/// Segments order by id first and role second, which is the order repair
/// consumes them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogSegment {
    pub id: SegmentId,
    pub role: LogRole,
    pub state: SegmentState,
}

impl LogSegment {
    pub fn new(id: SegmentId, role: LogRole, state: SegmentState) -> Self {
        Self { id, role, state }
    }

    pub fn with_state(self, state: SegmentState) -> Self {
        Self { state, ..self }
    }

    pub fn file_name(&self, version: &str) -> String {
        let role = self.role.suffix();
        let id = self.id;
        match self.state {
            SegmentState::Active => format!("{FILE_PREFIX}{version}_{id}.log{role}"),
            SegmentState::Rotated => format!("{FILE_PREFIX}{version}.log.{id}{role}"),
            SegmentState::Done => format!("{FILE_PREFIX}{version}.log.{id}{role}{DONE_SUFFIX}"),
        }
    }

    /// Parses a file name produced by [`LogSegment::file_name`] for `version`.
    /// Files of other versions and unrelated files yield `None`.
    pub fn from_file_name(version: &str, name: &str) -> Option<Self> {
        let rest = name.strip_prefix(FILE_PREFIX)?.strip_prefix(version)?;

        let (rest, done) = match rest.strip_suffix(DONE_SUFFIX) {
            Some(rest) => (rest, true),
            None => (rest, false),
        };
        let (rest, role) = if let Some(rest) = rest.strip_suffix(LogRole::Retry.suffix()) {
            (rest, LogRole::Retry)
        } else if let Some(rest) = rest.strip_suffix(LogRole::Error.suffix()) {
            (rest, LogRole::Error)
        } else {
            (rest, LogRole::Failure)
        };

        if let Some(id) = rest.strip_prefix(".log.") {
            let state = if done {
                SegmentState::Done
            } else {
                SegmentState::Rotated
            };
            return parse_id(id).map(|id| Self::new(id, role, state));
        }
        if done {
            return None;
        }
        let id = rest.strip_prefix('_')?.strip_suffix(".log")?;
        parse_id(id).map(|id| Self::new(id, role, SegmentState::Active))
    }
}

fn parse_id(value: &str) -> Option<SegmentId> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok().map(SegmentId)
}

/// Hands out strictly increasing segment ids: the current time in
/// milliseconds, or one past the last id when the clock has not advanced.
#[derive(Debug, Default)]
pub struct SegmentClock {
    last: AtomicU64,
}

impl SegmentClock {
    pub fn starting_after(last: SegmentId) -> Self {
        Self {
            last: AtomicU64::new(last.get()),
        }
    }

    pub fn next(&self) -> SegmentId {
        let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(current + 1);
            match self.last.compare_exchange(
                current,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return SegmentId(candidate),
                Err(observed) => current = observed,
            }
        }
    }

    /// Makes sure future ids sort after `id`.
    pub fn observe(&self, id: SegmentId) {
        self.last.fetch_max(id.get(), Ordering::SeqCst);
    }
}
