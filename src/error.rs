//! Error types for chatsearch.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`ChatSearchError`]. Callers that need to branch on the failure class (for
//! example the desktop shell deciding whether to show a "search degraded"
//! notice or to trigger a rebuild) should match on [`ChatSearchError::kind`]
//! rather than on the display string.
//!
//! # Examples
//!
//! ```
//! use chatsearch::error::{ChatSearchError, ErrorKind, Result};
//!
//! fn lookup(query: &str) -> Result<()> {
//!     if query.is_empty() {
//!         return Err(ChatSearchError::invalid_input("query must not be empty"));
//!     }
//!     Ok(())
//! }
//!
//! let err = lookup("").unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::InvalidInput);
//! ```

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a disk-space preflight can fail.
///
/// The variants stay distinct so that "the path is bad" is never confused with
/// "the disk is full".
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskSpaceError {
    /// No path, or an empty path, was supplied.
    #[error("Please provide path")]
    InvalidPath,

    /// The platform helper reported that the drive is not ready.
    #[error("Disk not ready")]
    NotReady,

    /// The platform helper reported that the drive does not exist.
    #[error("Disk not found")]
    NotFound,

    /// The OS could not resolve the path.
    #[error("No such file or directory: {0}")]
    PathError(String),

    /// Free space is below the configured minimum.
    #[error("Insufficient free space: {free} bytes available, {required} bytes required")]
    BelowThreshold { free: u64, required: u64 },

    /// The underlying OS query or helper process failed.
    #[error("Disk space query failed: {0}")]
    QueryFailed(String),
}

/// Coarse classification of a [`ChatSearchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidInput,
    DiskSpace,
    InsufficientDiskSpace,
    ConfigRead,
    ConfigWrite,
    IndexVersionMismatch,
    WorkerUnavailable,
    Io,
    Storage,
    Index,
    Serialization,
    Other,
}

/// The main error type for chatsearch operations.
#[derive(Error, Debug)]
pub enum ChatSearchError {
    /// Missing or malformed arguments, rejected before any I/O.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A disk-space query could not give a positive answer.
    #[error("Disk space error: {0}")]
    DiskSpace(#[from] DiskSpaceError),

    /// A write operation was refused by the disk-space preflight.
    #[error("Insufficient disk space: {0}")]
    InsufficientDiskSpace(DiskSpaceError),

    /// The user config file exists but could not be read or parsed.
    #[error("Config read error: {0}")]
    ConfigRead(String),

    /// The user config file could not be written.
    #[error("Config write error: {0}")]
    ConfigWrite(String),

    /// The on-disk index was written with a different schema version.
    #[error("Index version mismatch: index is {found}, engine expects {expected}")]
    IndexVersionMismatch { found: String, expected: String },

    /// The supervisor gave up restarting the worker.
    #[error("Search worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage backend errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Index structure errors (corrupt segment, broken manifest, ...).
    #[error("Index error: {0}")]
    Index(String),

    /// Binary encoding errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for operations that may fail with [`ChatSearchError`].
pub type Result<T> = std::result::Result<T, ChatSearchError>;

impl ChatSearchError {
    /// Create a new invalid input error.
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        ChatSearchError::InvalidInput(msg.into())
    }

    /// Create a new config read error.
    pub fn config_read<S: Into<String>>(msg: S) -> Self {
        ChatSearchError::ConfigRead(msg.into())
    }

    /// Create a new config write error.
    pub fn config_write<S: Into<String>>(msg: S) -> Self {
        ChatSearchError::ConfigWrite(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        ChatSearchError::Storage(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        ChatSearchError::Index(msg.into())
    }

    /// Create a new serialization error.
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        ChatSearchError::Serialization(msg.into())
    }

    /// Create a new worker unavailable error.
    pub fn worker_unavailable<S: Into<String>>(msg: S) -> Self {
        ChatSearchError::WorkerUnavailable(msg.into())
    }

    /// Create a new version mismatch error.
    pub fn version_mismatch<F: Into<String>, E: Into<String>>(found: F, expected: E) -> Self {
        ChatSearchError::IndexVersionMismatch {
            found: found.into(),
            expected: expected.into(),
        }
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        ChatSearchError::Other(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatSearchError::InvalidInput(_) => ErrorKind::InvalidInput,
            ChatSearchError::DiskSpace(_) => ErrorKind::DiskSpace,
            ChatSearchError::InsufficientDiskSpace(_) => ErrorKind::InsufficientDiskSpace,
            ChatSearchError::ConfigRead(_) => ErrorKind::ConfigRead,
            ChatSearchError::ConfigWrite(_) => ErrorKind::ConfigWrite,
            ChatSearchError::IndexVersionMismatch { .. } => ErrorKind::IndexVersionMismatch,
            ChatSearchError::WorkerUnavailable(_) => ErrorKind::WorkerUnavailable,
            ChatSearchError::Io(_) => ErrorKind::Io,
            ChatSearchError::Storage(_) => ErrorKind::Storage,
            ChatSearchError::Index(_) => ErrorKind::Index,
            ChatSearchError::Serialization(_) | ChatSearchError::Json(_) => {
                ErrorKind::Serialization
            }
            ChatSearchError::Other(_) => ErrorKind::Other,
        }
    }

    /// Flatten this error into a value that can cross the worker boundary.
    pub fn to_remote(&self) -> RemoteError {
        RemoteError {
            kind: self.kind(),
            message: self.to_string(),
            detail: match self {
                ChatSearchError::DiskSpace(e) | ChatSearchError::InsufficientDiskSpace(e) => {
                    Some(RemoteDetail::Disk(e.clone()))
                }
                ChatSearchError::IndexVersionMismatch { found, expected } => {
                    Some(RemoteDetail::Version {
                        found: found.clone(),
                        expected: expected.clone(),
                    })
                }
                _ => None,
            },
        }
    }
}

/// Extra structured payload preserved when an error crosses the worker boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteDetail {
    Disk(DiskSpaceError),
    Version { found: String, expected: String },
}

/// An error as reported by the worker.
///
/// `io::Error` and friends are not `Clone`, so errors are flattened to kind +
/// message inside the worker and rebuilt on the host side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<RemoteDetail>,
}

impl From<RemoteError> for ChatSearchError {
    fn from(remote: RemoteError) -> Self {
        match (remote.kind, remote.detail) {
            (ErrorKind::DiskSpace, Some(RemoteDetail::Disk(e))) => ChatSearchError::DiskSpace(e),
            (ErrorKind::InsufficientDiskSpace, Some(RemoteDetail::Disk(e))) => {
                ChatSearchError::InsufficientDiskSpace(e)
            }
            (_, Some(RemoteDetail::Version { found, expected })) => {
                ChatSearchError::IndexVersionMismatch { found, expected }
            }
            (ErrorKind::InvalidInput, _) => ChatSearchError::InvalidInput(remote.message),
            (ErrorKind::ConfigRead, _) => ChatSearchError::ConfigRead(remote.message),
            (ErrorKind::ConfigWrite, _) => ChatSearchError::ConfigWrite(remote.message),
            (ErrorKind::WorkerUnavailable, _) => ChatSearchError::WorkerUnavailable(remote.message),
            (ErrorKind::Io, _) => ChatSearchError::Io(io::Error::other(remote.message)),
            (ErrorKind::Storage, _) => ChatSearchError::Storage(remote.message),
            (ErrorKind::Index, _) => ChatSearchError::Index(remote.message),
            (ErrorKind::Serialization, _) => ChatSearchError::Serialization(remote.message),
            _ => ChatSearchError::Other(remote.message),
        }
    }
}

impl From<bincode::Error> for ChatSearchError {
    fn from(err: bincode::Error) -> Self {
        ChatSearchError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = ChatSearchError::invalid_input("empty path");
        assert_eq!(error.to_string(), "Invalid input: empty path");
        assert_eq!(error.kind(), ErrorKind::InvalidInput);

        let error = ChatSearchError::version_mismatch("v0", "v1");
        assert_eq!(
            error.to_string(),
            "Index version mismatch: index is v0, engine expects v1"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = ChatSearchError::from(io_error);

        match error {
            ChatSearchError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
    }

    #[test]
    fn test_remote_round_trip_keeps_detail() {
        let error = ChatSearchError::InsufficientDiskSpace(DiskSpaceError::BelowThreshold {
            free: 10,
            required: 20,
        });
        let rebuilt = ChatSearchError::from(error.to_remote());

        match rebuilt {
            ChatSearchError::InsufficientDiskSpace(DiskSpaceError::BelowThreshold {
                free,
                required,
            }) => {
                assert_eq!(free, 10);
                assert_eq!(required, 20);
            }
            other => panic!("unexpected error: {other}"),
        }

        let mismatch = ChatSearchError::from(ChatSearchError::version_mismatch("v0", "v1").to_remote());
        assert_eq!(mismatch.kind(), ErrorKind::IndexVersionMismatch);
    }
}
