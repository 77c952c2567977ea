//! Crate-wide error type.
//!
//! Background loops treat `ObjectStore` as transient (log and retry on the
//! next tick), `AlreadyExists` as a manifest generation conflict to be
//! retried after a refresh, and `Fenced` as terminal.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key not found")]
    KeyNotFound,

    #[error("object store failure: {0}")]
    ObjectStore(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("invalid db state: {0}")]
    InvalidDbState(String),

    /// The target manifest generation was already written by another writer.
    #[error("manifest generation already exists")]
    AlreadyExists,

    /// A newer writer epoch was observed; this writer must stop publishing.
    #[error("writer fenced by a newer epoch")]
    Fenced,

    #[error("operation cancelled before completion")]
    Cancelled,

    #[error("checksum mismatch: {0}")]
    Checksum(&'static str),
}

impl Error {
    pub(crate) fn invalid_db_state(msg: impl Into<String>) -> Error {
        Error::InvalidDbState(msg.into())
    }

    pub(crate) fn object_store(err: impl std::fmt::Display) -> Error {
        Error::ObjectStore(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::ObjectStore(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidDbState(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
