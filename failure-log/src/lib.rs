//! On-disk queue of mirror writes that did not reach the durable store.
//!
//! Each deployed version owns a set of segment files under a base directory.
//! The write path appends [`dsync_protocol::FailureRecord`] lines to the
//! active failure segment; rotation closes it and makes it visible to repair.
//! Repair drains rotated failure and retry segments oldest first, writing
//! records it cannot finish to its own retry and error segments.
//!
//! Every line is written with a single `write_all` followed by `sync_data`,
//! so a crash leaves at most a truncated final line, which repair quarantines.

mod dir;
mod error;
mod reader;
mod segment;
mod writer;

pub use dir::FailureLogDir;
pub use dir::FailureLogStatus;
pub use dir::SegmentFile;
pub use error::FailureLogError;
pub use error::Result;
pub use reader::RotatedLogReader;
pub use reader::SegmentLine;
pub use segment::LogRole;
pub use segment::LogSegment;
pub use segment::SegmentClock;
pub use segment::SegmentId;
pub use segment::SegmentState;
pub use writer::FailureLogWriter;
