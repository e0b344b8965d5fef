//! SQLite-backed durable store.
//!
//! Mirrors primary-store documents into a local SQLite database, one
//! `mirror_records` table keyed by container, kind and id, and keeps the
//! lease table used for per-resource repair locks. Write-path and repair
//! orchestration live in `dsync-core`.

mod error;
mod migrations;
mod model;
mod runtime;

pub use error::MirrorError;
pub use error::Result;
pub use model::LockLease;
pub use model::MirrorRecord;
/// Preferred entrypoint: owns the connection pool and the schema.
pub use runtime::MirrorRuntime;

pub use runtime::MIRROR_DB_FILENAME;
pub use runtime::MIRROR_DB_VERSION;
pub use runtime::mirror_db_filename;
pub use runtime::mirror_db_path;
