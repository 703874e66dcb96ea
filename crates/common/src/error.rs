//! Path errors shared by every crate that touches the local filesystem.

use thiserror::Error;

/// Path-related errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    /// A resolved path escaped the directory it must stay within.
    #[error("Path {path} is outside of the directory {directory}")]
    PathOutsideDirectory {
        /// The offending path.
        path: String,
        /// The directory it was required to stay within.
        directory: String,
    },

    /// A root that must be absolute was given as a relative path.
    #[error("Directory {path} must be an absolute path")]
    RelativeRoot { path: String },

    /// Path is invalid or malformed.
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    /// IO error occurred while accessing path.
    #[error("IO error at {path}: {message}")]
    IoError { path: String, message: String },
}

impl PathError {
    /// Create an IoError from std::io::Error.
    ///
    /// # Arguments
    /// * `path` - Path where the error occurred
    /// * `err` - The underlying IO error
    pub fn from_io(path: impl Into<String>, err: std::io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
