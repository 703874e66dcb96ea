//! Content-addressable storage for job attachments.
//!
//! This crate moves file content between local disk and an S3-compatible
//! Content-Addressable Storage (CAS) through the [`StorageClient`] trait.
//! Backends live in their own crates; [`MemoryStorageClient`] serves tests.
//!
//! # Transfers
//!
//! - [`UploadOrchestrator`] - dedupes against the CAS and uploads manifest content
//! - [`DownloadOrchestrator`] - materializes manifests with conflict handling
//! - [`OutputDownloader`] - discovers and downloads a job's outputs
//!
//! # Caching
//!
//! Two SQLite caches share one connection and lock discipline:
//!
//! - **Hash Cache** - file hashes, to avoid re-hashing unchanged files
//! - **S3 Check Cache** - CAS keys known to exist, to avoid redundant HEAD requests
//!
//! # Manifest Storage
//!
//! The `manifest_storage` module writes manifests with their root metadata
//! and finds the latest output manifests of a job, step or task.

pub mod cache_db;
mod cas;
pub mod download;
mod error;
pub mod hash_cache;
pub mod manifest_storage;
mod memory;
pub mod s3_check_cache;
mod traits;
mod types;
pub mod upload;

pub use cache_db::{default_cache_dir, CacheError, LockManager};
pub use cas::{adjust_chunk_size, generate_parts, needs_multipart, plan_multipart, PartInfo};
pub use download::{
    apply_fs_permission_settings, ensure_paths_within_directory, set_file_mtime,
    DownloadOrchestrator, DownloadResult, OutputDownloader,
};
pub use error::{S3Action, StorageClientError, StorageError};
pub use hash_cache::{HashCache, HashCacheEntry};
pub use manifest_storage::{
    compute_root_path_hash, discover_output_manifest_keys, download_manifest,
    float_to_iso_datetime_string, get_manifest_metadata, get_output_manifests_by_asset_root,
    manifest_content_type, upload_output_manifest, ManifestS3Metadata, OutputManifestScope,
};
pub use memory::{MemoryClientStats, MemoryStorageClient};
pub use s3_check_cache::{S3CheckCache, S3CheckCacheEntry};
pub use traits::{ByteProgress, CompletedPart, ObjectInfo, StorageClient, TrackerBytes};
pub use types::{
    generate_random_guid, join_s3_paths, AwsCredentials, ConflictResolution,
    FileSystemPermissionSettings, FileSystemPermissionWarning, JobAttachmentSettings,
    StorageSettings, TransferSettings,
};
pub use upload::{UploadOrchestrator, MANIFEST_S3_MAPPING_FILE};
