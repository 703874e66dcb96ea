//! Process management for the job attachments virtual file system.
//!
//! Inputs can be served by a FUSE process (`deadline_vfs`) that fetches CAS
//! objects on demand instead of copying every file up front. This crate
//! locates that executable, launches one process per mounted asset root,
//! tracks the processes in a per-session pid ledger and unmounts them when
//! the session ends. The FUSE process itself is external.
//!
//! ```text
//! VfsInstallation  locate executable, unmount, kill all for a session
//! VfsProcessManager  launch one mount and record it
//! PidLedger  <session>/vfs_pids.txt, "mount:pid:manifest" lines
//! ```

pub mod error;
pub mod install;
pub mod ledger;
pub mod mount;
pub mod options;
pub mod process;

pub use error::VfsError;
pub use install::{
    VfsInstallation, DEADLINE_VFS_CACHE_ENV_VAR, DEADLINE_VFS_ENV_VAR, DEADLINE_VFS_EXECUTABLE,
    DEADLINE_VFS_INSTALL_PATH,
};
pub use ledger::{PidLedger, PidLedgerEntry, DEADLINE_VFS_PID_FILE_NAME};
pub use mount::{is_mount, log_vfs_log_tail, wait_for_mount};
pub use options::{
    VfsLaunchOptions, DEFAULT_MOUNT_WAIT, VFS_CACHE_REL_PATH_IN_SESSION,
    VFS_LOGS_FOLDER_IN_SESSION, VFS_MANIFEST_FOLDER_IN_SESSION,
};
pub use process::{VfsProcessManager, DEADLINE_MANIFEST_GROUP_READ_PERMS};
