//! Storage engine errors.

use std::path::PathBuf;

use sctl_core::ErrorKind;
use thiserror::Error;

/// Errors from the storage engine.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A filesystem operation failed.
    #[error("storage I/O error at {path}: {source}")]
    Io {
        /// Path the operation touched.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The storage root exists but is not a directory.
    #[error("storage path {0} is not a directory")]
    NotADirectory(PathBuf),

    /// Streamed content grew past the configured maximum.
    #[error("artifact exceeds the maximum size of {limit} bytes")]
    SizeExceeded {
        /// Configured limit in bytes.
        limit: u64,
    },

    /// The requested artifact does not exist.
    #[error("artifact {0} not found")]
    NotFound(String),

    /// Refused to delete the owner's current artifact without force.
    #[error("artifact {0} is the current artifact of its owner")]
    CurrentArtifact(String),
}

impl StorageError {
    /// Cross-crate classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::NotADirectory(_) => ErrorKind::Io,
            Self::SizeExceeded { .. } => ErrorKind::SizeExceeded,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::CurrentArtifact(_) => ErrorKind::Validation,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
