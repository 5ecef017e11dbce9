use std::path::PathBuf;
use thiserror::Error;

use crate::daemon::protocol::ErrorKind;
use crate::lock::CurrentHolder;

#[derive(Error, Debug)]
pub enum ConfdError {
    #[error("lock failed on '{}': {reason}", path.display())]
    LockFailed {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("lock '{}' is held by another process ({holder})", path.display())]
    LockHeld { path: PathBuf, holder: CurrentHolder },

    #[error("we didn't have the lock on '{}', but we should have", path.display())]
    LockNotHeld { path: PathBuf },

    #[error("no configuration server: {0}")]
    NoServer(String),

    #[error("configuration server is shutting down")]
    InShutdown,

    #[error("bad key '{key}': {reason}")]
    BadKey { key: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConfdError {
    pub(crate) fn lock_failed(
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::LockFailed {
            path: path.into(),
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Wire-level classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LockFailed { .. } | Self::LockHeld { .. } | Self::LockNotHeld { .. } => {
                ErrorKind::LockFailed
            }
            Self::NoServer(_) => ErrorKind::NoServer,
            Self::InShutdown => ErrorKind::InShutdown,
            Self::BadKey { .. } => ErrorKind::BadKey,
            Self::Protocol(_) | Self::Failed(_) | Self::Io(_) => ErrorKind::Failed,
        }
    }

    /// Rebuild an error received over the wire.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::InShutdown => Self::InShutdown,
            ErrorKind::NoServer => Self::NoServer(message),
            ErrorKind::BadKey => Self::BadKey {
                key: String::new(),
                reason: message,
            },
            ErrorKind::LockFailed | ErrorKind::Failed => Self::Failed(message),
        }
    }

    pub fn is_in_shutdown(&self) -> bool {
        matches!(self, Self::InShutdown)
    }
}

pub type Result<T> = std::result::Result<T, ConfdError>;
