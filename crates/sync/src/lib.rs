//! Job-level synchronization of job attachments.
//!
//! Ties grouping, hashing and transfer together for the two sides of a job:
//!
//! - [`AssetManager`] - submitter side: groups input paths by root, hashes
//!   them into manifests and uploads content plus manifests
//! - [`AssetSync`] - worker side: materializes a job's inputs in a session
//!   directory and uploads what each session action produced
//!
//! Input roots can instead be served by `deadline_vfs` mounts; the
//! [`vfs_mount`] module prepares the session folders and launches one mount
//! per root.

mod asset_manager;
mod asset_sync;
mod error;
pub mod vfs_mount;

pub use asset_manager::AssetManager;
pub use asset_sync::{
    ensure_disk_capacity, unique_dest_dir_name, AssetSync, SessionAction, SyncInputsOptions,
};
pub use error::SyncError;
pub use vfs_mount::{mount_vfs_from_manifests, VfsSessionDirs};
