use crate::entry::EntryId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Clipboard hiccup; callers retry with a bounded budget.
    #[error("clipboard temporarily unavailable: {0}")]
    TransientIo(String),

    #[error("no entry with id {0}")]
    NotFound(EntryId),

    #[error("history index is corrupt: {0}")]
    PersistenceCorruption(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("another instance already owns the control channel")]
    AlreadyRunning,

    #[error("no clipstack daemon is running")]
    NotRunning,

    #[error("malformed control message: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientIo(_))
    }
}
