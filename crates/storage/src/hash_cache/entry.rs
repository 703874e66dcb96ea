//! Hash cache entry type.

use ja_model::HashAlgorithm;

/// A cached file hash.
///
/// Valid only while `last_modified_time` equals the file's current
/// modification time, rendered as integer microseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashCacheEntry {
    /// Absolute path of the hashed file.
    pub file_path: String,
    pub hash_algorithm: HashAlgorithm,
    pub file_hash: String,
    pub last_modified_time: String,
}

impl HashCacheEntry {
    /// Create an entry for a file hashed at modification time `mtime_us`.
    ///
    /// # Arguments
    /// * `file_path` - Absolute file path
    /// * `hash_algorithm` - Algorithm that produced `file_hash`
    /// * `file_hash` - Hex digest
    /// * `mtime_us` - Modification time in microseconds since epoch
    pub fn new(
        file_path: impl Into<String>,
        hash_algorithm: HashAlgorithm,
        file_hash: impl Into<String>,
        mtime_us: i64,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            hash_algorithm,
            file_hash: file_hash.into(),
            last_modified_time: mtime_us.to_string(),
        }
    }

    /// Whether this entry still describes a file last modified at `mtime_us`.
    pub fn is_fresh(&self, mtime_us: i64) -> bool {
        self.last_modified_time == mtime_us.to_string()
    }
}
