//! Hash cache for avoiding redundant file hashing.
//!
//! Maps an absolute file path to its last computed hash and the
//! modification time it was computed at. Stored in `hash_cache.db`.
//!
//! If the database cannot be opened the cache disables itself: every
//! lookup misses and every store is a no-op, so hashing still works.

mod entry;

pub use entry::HashCacheEntry;

use std::path::Path;
use std::str::FromStr;

use ja_model::HashAlgorithm;
use rusqlite::{params, OptionalExtension};

use crate::cache_db::{CacheDb, CacheError};

/// Database file stem.
pub const HASH_CACHE_NAME: &str = "hash_cache";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS hashesV2(\
    file_path text primary key, \
    hash_algorithm text secondary key, \
    file_hash text, \
    last_modified_time timestamp)";

/// Persistent (file path, algorithm) -> hash cache.
#[derive(Debug)]
pub struct HashCache {
    db: Option<CacheDb>,
}

impl HashCache {
    /// Open the cache in `cache_dir` (default `~/.deadline/job_attachments`).
    ///
    /// Failure to open is logged and yields a disabled cache.
    pub fn open(cache_dir: Option<&Path>) -> Self {
        match Self::try_open(cache_dir) {
            Ok(cache) => cache,
            Err(e) => {
                log::warn!("Hash cache disabled: {}", e);
                Self::disabled()
            }
        }
    }

    /// Open the cache, returning the error instead of degrading.
    pub fn try_open(cache_dir: Option<&Path>) -> Result<Self, CacheError> {
        Ok(Self {
            db: Some(CacheDb::open(cache_dir, HASH_CACHE_NAME, SCHEMA)?),
        })
    }

    /// A cache that never hits and never stores.
    pub fn disabled() -> Self {
        Self { db: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.db.is_some()
    }

    /// Look up the entry for `file_path` hashed with `hash_algorithm`.
    ///
    /// Database errors are logged and treated as a miss.
    pub fn get_entry(
        &self,
        file_path: &str,
        hash_algorithm: HashAlgorithm,
    ) -> Option<HashCacheEntry> {
        let db: &CacheDb = self.db.as_ref()?;
        let row: Result<Option<(String, String, String)>, CacheError> = db.with_connection(|c| {
            c.query_row(
                "SELECT hash_algorithm, file_hash, last_modified_time FROM hashesV2 \
                 WHERE file_path = ?1 AND hash_algorithm = ?2",
                params![file_path, hash_algorithm.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
        });

        match row {
            Ok(Some((alg, file_hash, last_modified_time))) => {
                let hash_algorithm: HashAlgorithm = HashAlgorithm::from_str(&alg).ok()?;
                Some(HashCacheEntry {
                    file_path: file_path.to_string(),
                    hash_algorithm,
                    file_hash,
                    last_modified_time,
                })
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Hash cache lookup failed for {}: {}", file_path, e);
                None
            }
        }
    }

    /// Insert or replace the entry for `entry.file_path`.
    pub fn put_entry(&self, entry: &HashCacheEntry) -> Result<(), CacheError> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        db.with_write(|c| {
            c.execute(
                "INSERT OR REPLACE INTO hashesV2 VALUES(?1, ?2, ?3, ?4)",
                params![
                    entry.file_path,
                    entry.hash_algorithm.as_str(),
                    entry.file_hash,
                    entry.last_modified_time
                ],
            )
        })?;
        Ok(())
    }

    /// Close the connections opened so far. The cache reopens them on next use.
    pub fn close(&self) {
        if let Some(db) = &self.db {
            db.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_cache_miss() {
        let dir: TempDir = TempDir::new().unwrap();
        let cache: HashCache = HashCache::try_open(Some(dir.path())).unwrap();

        assert!(cache.get_entry("/a/file.txt", HashAlgorithm::Xxh128).is_none());
        assert!(dir.path().join("hash_cache.db").exists());
    }

    #[test]
    fn test_put_then_get_and_replace() {
        let dir: TempDir = TempDir::new().unwrap();
        let cache: HashCache = HashCache::try_open(Some(dir.path())).unwrap();

        let first: HashCacheEntry =
            HashCacheEntry::new("/a/file.txt", HashAlgorithm::Xxh128, "hash1", 100);
        cache.put_entry(&first).unwrap();
        assert_eq!(
            cache.get_entry("/a/file.txt", HashAlgorithm::Xxh128),
            Some(first)
        );

        let second: HashCacheEntry =
            HashCacheEntry::new("/a/file.txt", HashAlgorithm::Xxh128, "hash2", 200);
        cache.put_entry(&second).unwrap();
        let found: HashCacheEntry = cache
            .get_entry("/a/file.txt", HashAlgorithm::Xxh128)
            .unwrap();
        assert_eq!(found.file_hash, "hash2");
        assert!(found.is_fresh(200));
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir: TempDir = TempDir::new().unwrap();
        {
            let cache: HashCache = HashCache::try_open(Some(dir.path())).unwrap();
            cache
                .put_entry(&HashCacheEntry::new("/x", HashAlgorithm::Xxh128, "h", 1))
                .unwrap();
            cache.close();
        }
        let reopened: HashCache = HashCache::try_open(Some(dir.path())).unwrap();
        assert!(reopened.get_entry("/x", HashAlgorithm::Xxh128).is_some());
    }

    #[test]
    fn test_disabled_cache_is_inert() {
        let cache: HashCache = HashCache::disabled();
        let entry: HashCacheEntry = HashCacheEntry::new("/x", HashAlgorithm::Xxh128, "h", 1);

        assert!(!cache.is_enabled());
        cache.put_entry(&entry).unwrap();
        assert!(cache.get_entry("/x", HashAlgorithm::Xxh128).is_none());
    }

    #[test]
    fn test_unusable_directory_degrades() {
        let dir: TempDir = TempDir::new().unwrap();
        let not_a_dir: std::path::PathBuf = dir.path().join("file");
        std::fs::write(&not_a_dir, b"x").unwrap();

        let cache: HashCache = HashCache::open(Some(&not_a_dir));
        assert!(!cache.is_enabled());
    }

    #[test]
    fn test_concurrent_writers_from_threads() {
        let dir: TempDir = TempDir::new().unwrap();
        let cache: Arc<HashCache> = Arc::new(HashCache::try_open(Some(dir.path())).unwrap());

        let handles: Vec<std::thread::JoinHandle<()>> = (0..4)
            .map(|i| {
                let cache: Arc<HashCache> = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for j in 0..10 {
                        let path: String = format!("/t{}/f{}", i, j);
                        cache
                            .put_entry(&HashCacheEntry::new(path, HashAlgorithm::Xxh128, "h", j))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.get_entry("/t3/f9", HashAlgorithm::Xxh128).is_some());
    }
}
