//! Library error type.
//!
//! All fallible operations in this crate return [`Result`]. I/O failures
//! carry the path of the offending file so callers can exclude it and keep
//! processing other files.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the duplicate index.
#[derive(Debug, Error)]
pub enum Error {
    /// A stat, open or read failed for the named file.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path of the file whose I/O failed.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Wrap an `io::Error` with the path it occurred on.
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Path of the file that caused this error.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Io { path, .. } => path,
        }
    }

    /// Kind of the underlying I/O error.
    #[must_use]
    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::Io { source, .. } => source.kind(),
        }
    }
}
