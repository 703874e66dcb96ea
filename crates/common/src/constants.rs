//! Defaults shared across the job attachments crates.

/// Bytes per multipart part before any size adjustment (8 MiB).
pub const DEFAULT_MULTIPART_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Smallest part size accepted by S3 for all but the last part (5 MiB).
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest part count a single multipart upload may have.
pub const S3_MAX_PARTS: u64 = 10_000;

/// Above this many paths the uploader lists the CAS prefix instead of probing each object.
pub const DEFAULT_LIST_OBJECT_THRESHOLD: usize = 100;

/// Parallel part uploads for one large file.
pub const DEFAULT_MULTIPART_MAX_WORKERS: usize = 10;

/// Files up to `chunk_size * multiplier` bytes go to the small-file queue.
pub const DEFAULT_SMALL_FILE_THRESHOLD_MULTIPLIER: u64 = 20;

/// Connection pool size assumed when sizing the small-file upload pool.
pub const DEFAULT_S3_MAX_POOL_CONNECTIONS: usize = 50;

/// Parallel whole-file downloads.
pub const DEFAULT_DOWNLOAD_MAX_CONCURRENCY: usize = 10;

/// Parallel file hashing tasks.
pub const DEFAULT_HASH_MAX_CONCURRENCY: usize = 8;

/// Read buffer used while hashing files.
pub const HASH_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Minimum interval between progress callbacks.
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 1;

/// Completed files that force a progress callback regardless of interval.
pub const DEFAULT_FILES_IN_CHUNK: u64 = 50;

/// S3 check cache entries older than this are treated as unknown.
pub const S3_CHECK_CACHE_EXPIRY_DAYS: i64 = 30;
