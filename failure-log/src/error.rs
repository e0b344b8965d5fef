use std::path::PathBuf;

use dsync_protocol::ParseRecordError;

#[derive(Debug, thiserror::Error)]
pub enum FailureLogError {
    #[error("failure log directory {} does not exist", .0.display())]
    MissingDir(PathBuf),

    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode failure record: {0}")]
    Encode(#[from] ParseRecordError),
}

impl FailureLogError {
    pub(crate) fn io(
        action: &'static str,
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io {
            action,
            path,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, FailureLogError>;
