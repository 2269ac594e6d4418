//! Error taxonomy for store operations.

use std::io;

use recdb_lock::LockError;
use serde::{Deserialize, Serialize};

use crate::RecNo;

/// Result type alias for record store operations.
pub type Result<T> = std::result::Result<T, DbError>;

/// Serialisable error classification, shared by local and remote callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Record number outside the valid set.
    RecordNotFound,
    /// Missing or mismatched lock cookie.
    InvalidCookie,
    /// Reserved for composite-key schemas.
    DuplicateKey,
    /// Malformed database file.
    CorruptFile,
    /// Lock not granted before the caller's deadline.
    LockTimeout,
    /// Rejected argument.
    InvalidArgument,
    /// Store already closed.
    Closed,
    /// File I/O failure.
    Io,
    /// Socket or protocol failure.
    Transport,
}

impl ErrorKind {
    /// Stable lowercase label, used for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RecordNotFound => "record_not_found",
            ErrorKind::InvalidCookie => "invalid_cookie",
            ErrorKind::DuplicateKey => "duplicate_key",
            ErrorKind::CorruptFile => "corrupt_file",
            ErrorKind::LockTimeout => "lock_timeout",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Closed => "closed",
            ErrorKind::Io => "io",
            ErrorKind::Transport => "transport",
        }
    }
}

/// Record store errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Record not found.
    #[error("record {0} not found")]
    RecordNotFound(RecNo),
    /// Lock cookie does not hold the record's lock.
    #[error("invalid lock cookie for record {0}")]
    InvalidCookie(RecNo),
    /// Duplicate key.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    /// Database file failed validation.
    #[error("corrupt database file: {0}")]
    CorruptFile(String),
    /// Lock wait exceeded its deadline.
    #[error("timed out waiting for lock on record {0}")]
    LockTimeout(RecNo),
    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Store closed.
    #[error("record store is closed")]
    Closed,
    /// Underlying file I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Socket or protocol error.
    #[error("transport error: {0}")]
    Transport(String),
}

impl DbError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::RecordNotFound(_) => ErrorKind::RecordNotFound,
            DbError::InvalidCookie(_) => ErrorKind::InvalidCookie,
            DbError::DuplicateKey(_) => ErrorKind::DuplicateKey,
            DbError::CorruptFile(_) => ErrorKind::CorruptFile,
            DbError::LockTimeout(_) => ErrorKind::LockTimeout,
            DbError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            DbError::Closed => ErrorKind::Closed,
            DbError::Io(_) => ErrorKind::Io,
            DbError::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Record number the error refers to, if any.
    pub fn rec_no(&self) -> Option<RecNo> {
        match self {
            DbError::RecordNotFound(n) | DbError::InvalidCookie(n) | DbError::LockTimeout(n) => {
                Some(*n)
            }
            _ => None,
        }
    }

    /// Free-form detail carried by the error, without the kind prefix.
    pub fn detail(&self) -> String {
        match self {
            DbError::DuplicateKey(s)
            | DbError::CorruptFile(s)
            | DbError::InvalidArgument(s)
            | DbError::Transport(s) => s.clone(),
            DbError::Io(e) => e.to_string(),
            _ => String::new(),
        }
    }

    /// Rebuild an error from its parts, the inverse of [`DbError::kind`],
    /// [`DbError::rec_no`] and [`DbError::detail`].
    pub fn from_parts(kind: ErrorKind, rec_no: Option<RecNo>, detail: String) -> Self {
        let rec_no = rec_no.unwrap_or_default();
        match kind {
            ErrorKind::RecordNotFound => DbError::RecordNotFound(rec_no),
            ErrorKind::InvalidCookie => DbError::InvalidCookie(rec_no),
            ErrorKind::DuplicateKey => DbError::DuplicateKey(detail),
            ErrorKind::CorruptFile => DbError::CorruptFile(detail),
            ErrorKind::LockTimeout => DbError::LockTimeout(rec_no),
            ErrorKind::InvalidArgument => DbError::InvalidArgument(detail),
            ErrorKind::Closed => DbError::Closed,
            ErrorKind::Io => DbError::Io(io::Error::new(io::ErrorKind::Other, detail)),
            ErrorKind::Transport => DbError::Transport(detail),
        }
    }

    /// Fatal errors leave the store unusable; the rest are ordinary outcomes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::CorruptFile(_) | DbError::Io(_))
    }
}

impl From<LockError> for DbError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::RecordNotFound(n) => DbError::RecordNotFound(n),
            LockError::InvalidCookie(n) => DbError::InvalidCookie(n),
            LockError::Timeout(n) => DbError::LockTimeout(n),
            LockError::Closed => DbError::Closed,
        }
    }
}
