//! Error types for size computation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced to callers of the engine.
///
/// Per-entry problems found while walking a tree are not errors at this
/// level; they are recorded as [`EntryError`]s and the walk continues.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Malformed path input. Never retried.
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// Path not found (possibly deleted while we were looking at it).
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The scan was cancelled before it produced anything.
    #[error("Scan cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The scheduler no longer accepts work.
    #[error("Scheduler is shut down")]
    ShutDown,

    /// Other error.
    #[error("{message}")]
    Other { message: String },
}

impl ScanError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }

    /// Create an invalid path error.
    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Convert into a per-entry error, for failures on a child of a walk.
    pub fn into_entry_error(self) -> EntryError {
        match self {
            Self::PermissionDenied { path } => EntryError::permission_denied(path),
            Self::NotFound { path } => EntryError::vanished(path),
            Self::Io { path, source } => EntryError::read_error(path, &source),
            Self::InvalidPath { path, reason } => {
                EntryError::new(path, reason, EntryErrorKind::MetadataError)
            }
            other => EntryError::new(PathBuf::new(), other.to_string(), EntryErrorKind::ReadError),
        }
    }
}

/// Kind of per-entry error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryErrorKind {
    /// Permission was denied.
    PermissionDenied,
    /// The entry disappeared between listing and stat.
    NotFound,
    /// Symbolic link target does not exist.
    BrokenSymlink,
    /// Error reading a directory.
    ReadError,
    /// Error reading metadata.
    MetadataError,
}

impl EntryErrorKind {
    /// Whether bytes may be missing from a total because of this error.
    ///
    /// A vanished file no longer occupies space and a broken link never
    /// did, so neither makes the parent total a lower bound.
    pub fn loses_bytes(self) -> bool {
        matches!(
            self,
            Self::PermissionDenied | Self::ReadError | Self::MetadataError
        )
    }
}

/// Non-fatal error recorded against a single entry during a walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryError {
    /// Path where the error occurred.
    pub path: PathBuf,
    /// Human-readable message.
    pub message: String,
    /// Kind of error.
    pub kind: EntryErrorKind,
}

impl EntryError {
    /// Create a new entry error.
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>, kind: EntryErrorKind) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            kind,
        }
    }

    /// Create a permission denied error.
    pub fn permission_denied(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            message: format!("Permission denied: {}", path.display()),
            path,
            kind: EntryErrorKind::PermissionDenied,
        }
    }

    /// Create an error for an entry that vanished mid-walk.
    pub fn vanished(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            message: format!("Vanished during scan: {}", path.display()),
            path,
            kind: EntryErrorKind::NotFound,
        }
    }

    /// Create a broken symlink error.
    pub fn broken_symlink(path: impl Into<PathBuf>, target: &str) -> Self {
        let path = path.into();
        Self {
            message: format!("Broken symlink: {} -> {target}", path.display()),
            path,
            kind: EntryErrorKind::BrokenSymlink,
        }
    }

    /// Create a read error.
    pub fn read_error(path: impl Into<PathBuf>, error: &std::io::Error) -> Self {
        let path = path.into();
        Self {
            message: format!("Read error: {error}"),
            path,
            kind: EntryErrorKind::ReadError,
        }
    }

    /// Create an entry error from an I/O error, classifying it by kind.
    pub fn from_io(path: impl Into<PathBuf>, error: &std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::PermissionDenied => Self::permission_denied(path),
            std::io::ErrorKind::NotFound => Self::vanished(path),
            _ => Self::read_error(path, error),
        }
    }

    /// Whether this error makes the enclosing total a lower bound.
    pub fn loses_bytes(&self) -> bool {
        self.kind.loses_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_error_io() {
        let err = ScanError::io(
            "/test/path",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, ScanError::PermissionDenied { .. }));

        let err = ScanError::io(
            "/test/path",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, ScanError::NotFound { .. }));
    }

    #[test]
    fn test_entry_error_creation() {
        let err = EntryError::permission_denied("/test/path");
        assert_eq!(err.kind, EntryErrorKind::PermissionDenied);
        assert!(err.message.contains("Permission denied"));
        assert!(err.loses_bytes());
    }

    #[test]
    fn test_vanished_and_broken_links_do_not_lose_bytes() {
        assert!(!EntryError::vanished("/gone").loses_bytes());
        assert!(!EntryError::broken_symlink("/link", "/nowhere").loses_bytes());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        assert!(EntryError::from_io("/x", &io).loses_bytes());
    }

    #[test]
    fn test_into_entry_error_keeps_kind() {
        let err = ScanError::NotFound {
            path: PathBuf::from("/a"),
        };
        assert_eq!(err.into_entry_error().kind, EntryErrorKind::NotFound);
    }
}
