//! Shared building blocks for the job attachments crates.
//!
//! - XXH128 content hashing
//! - Path normalization and containment checks
//! - Progress callbacks and the shared [`ProgressTracker`]
//! - Summary statistics reported by hashing, upload and download
//! - Tunable defaults and path errors

pub mod constants;
pub mod error;
pub mod hash;
pub mod path_utils;
pub mod progress;
pub mod tracker;

pub use constants::*;
pub use error::PathError;
pub use hash::{hash_bytes, hash_file, hash_file_with_progress, short_hash, Xxh3Hasher};
pub use path_utils::{
    from_posix_path, is_within_root, lexical_normalize, normalize_for_manifest,
    resolve_existing_prefix, to_absolute, to_posix_path,
};
pub use progress::{progress_fn, FnProgress, NoOpProgress, ProgressCallback};
pub use tracker::{
    human_readable_file_size, DownloadSummaryStatistics, ProgressReportMetadata, ProgressStatus,
    ProgressTracker, SummaryStatistics,
};
