//! Root of the `dsync-core` library.
//!
//! Keeps a durable copy of every primary-store document. Writes go through
//! [`DataSourceAccessor`], which mirrors each successful primary write and
//! logs the ones that could not be mirrored; [`RepairEngine`] later replays
//! that log until both stores agree.

// Library code reports through tracing only.
#![deny(clippy::print_stdout, clippy::print_stderr)]

mod accessor;
pub mod config;
mod error;
mod lock;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
mod mirror;
mod primary;
pub mod repair;
pub mod state_db;

pub use accessor::DataSourceAccessor;
pub use config::Config;
pub use config::ConfigError;
pub use config::find_dsync_home;
pub use error::AccessorError;
pub use error::LockError;
pub use error::PrimaryStoreError;
pub use error::RepairError;
pub use error::StoreSide;
pub use lock::LockManager;
pub use lock::ResourceLock;
pub use mirror::MirrorAccessor;
pub use mirror::MirrorStore;
pub use primary::BulkRequest;
pub use primary::Hit;
pub use primary::PrimaryStore;
pub use primary::PrimaryWrite;
pub use primary::SearchHits;
pub use repair::Completion;
pub use repair::RepairEngine;
pub use repair::RepairService;
pub use repair::SweepReport;
pub use repair::SweepStats;
pub use state_db::DurableStore;
pub use state_db::SqliteLockManager;
