//! Types shared by the write path, the failure log and the repair engine.

mod document;
mod lock_key;
mod record;

pub use document::Document;
pub use document::MirrorKind;
pub use document::USER_DATA_TYPE;
pub use lock_key::LockCategory;
pub use lock_key::LockKey;
pub use lock_key::ParseLockKeyError;
pub use record::FailureRecord;
pub use record::NO_VERSION;
pub use record::OperationKind;
pub use record::ParseRecordError;
