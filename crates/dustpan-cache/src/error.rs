//! Cache store errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the cache store.
///
/// At runtime these are logged and treated as a miss; only
/// [`CacheError::Unrecoverable`] from opening the store is fatal.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A statement failed.
    #[error("SQLite error while {context}: {source}")]
    Sql {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Filesystem error around the database file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The database failed its integrity check.
    #[error("Cache database {path} is corrupt: {details}")]
    Corrupt { path: PathBuf, details: String },

    /// The database could not be recreated after a failure.
    #[error("Cache database {path} could not be recreated: {details}")]
    Unrecoverable { path: PathBuf, details: String },

    /// No per-user data directory to put the default database in.
    #[error("No per-user data directory available")]
    NoDataDir,

    /// The store has been closed.
    #[error("Cache store is closed")]
    Closed,
}

impl From<rusqlite::Error> for CacheError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Sql {
            context: "executing statement",
            source,
        }
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Attach a short description of the failing step to SQLite errors.
pub(crate) trait SqlContext<T> {
    fn context(self, context: &'static str) -> Result<T>;
}

impl<T> SqlContext<T> for std::result::Result<T, rusqlite::Error> {
    fn context(self, context: &'static str) -> Result<T> {
        self.map_err(|source| CacheError::Sql { context, source })
    }
}
