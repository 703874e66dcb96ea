//! Error types for the VFS crate.

use thiserror::Error;

/// Errors that can occur while managing VFS processes.
#[derive(Debug, Error)]
pub enum VfsError {
    /// `deadline_vfs` is not on `PATH` or under any install location.
    #[error("Unable to locate the deadline_vfs executable")]
    ExecutableMissing,

    /// The process started but the mount never appeared.
    #[error("Failed to mount the virtual file system at {mount_point}")]
    FailedToMount { mount_point: String },

    /// VFS operations run as the job user, which must be known.
    #[error("No OS user set; cannot manage virtual file system processes")]
    OsUserNotSet,

    /// The VFS only runs on POSIX hosts.
    #[error("The virtual file system is not supported on this platform")]
    Unsupported,

    #[error("Failed to launch '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A pid ledger line is not `mount:pid:manifest`.
    #[error("Malformed entry in VFS pid file {path}: '{line}'")]
    MalformedLedger { path: String, line: String },
}

impl VfsError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        VfsError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
