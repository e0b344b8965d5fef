mod mirror_record;
mod resource_lock;

pub use mirror_record::MirrorRecord;
pub use resource_lock::LockLease;

pub(crate) use mirror_record::MIRROR_RECORD_COLUMNS;
