//! S3 check cache for avoiding redundant existence checks.
//!
//! Records which CAS objects were recently confirmed present so the
//! uploader can skip the HEAD or LIST that would otherwise precede an
//! upload. Entries older than 30 days are ignored.
//!
//! Key distinction:
//! - Hash Cache: `file path -> (hash, mtime)` - avoids re-hashing local files
//! - S3 Check Cache: `bucket/key -> last_seen_time` - avoids existence requests

mod entry;

pub use entry::{cache_key, S3CheckCacheEntry};

use std::path::Path;

use chrono::{Duration, Utc};
use ja_common::S3_CHECK_CACHE_EXPIRY_DAYS;
use rusqlite::{params, OptionalExtension};

use crate::cache_db::{CacheDb, CacheError};

/// Database file stem.
pub const S3_CHECK_CACHE_NAME: &str = "s3_check_cache";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS s3checkV1(\
    s3_key text primary key, \
    last_seen_time timestamp)";

/// Persistent `bucket/key -> last seen` cache.
#[derive(Debug)]
pub struct S3CheckCache {
    db: Option<CacheDb>,
    max_age: Duration,
}

impl S3CheckCache {
    /// Open the cache in `cache_dir` (default `~/.deadline/job_attachments`).
    ///
    /// Failure to open is logged and yields a disabled cache.
    pub fn open(cache_dir: Option<&Path>) -> Self {
        match Self::try_open(cache_dir) {
            Ok(cache) => cache,
            Err(e) => {
                log::warn!("S3 check cache disabled: {}", e);
                Self::disabled()
            }
        }
    }

    pub fn try_open(cache_dir: Option<&Path>) -> Result<Self, CacheError> {
        Ok(Self {
            db: Some(CacheDb::open(cache_dir, S3_CHECK_CACHE_NAME, SCHEMA)?),
            max_age: Duration::days(S3_CHECK_CACHE_EXPIRY_DAYS),
        })
    }

    pub fn disabled() -> Self {
        Self {
            db: None,
            max_age: Duration::days(S3_CHECK_CACHE_EXPIRY_DAYS),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.db.is_some()
    }

    /// Unexpired entry for `s3_key`, if any.
    pub fn get_entry(&self, s3_key: &str) -> Option<S3CheckCacheEntry> {
        let db: &CacheDb = self.db.as_ref()?;
        let row: Result<Option<String>, CacheError> = db.with_connection(|c| {
            c.query_row(
                "SELECT last_seen_time FROM s3checkV1 WHERE s3_key = ?1",
                params![s3_key],
                |r| r.get(0),
            )
            .optional()
        });

        let last_seen_time: String = match row {
            Ok(found) => found?,
            Err(e) => {
                log::warn!("S3 check cache lookup failed for {}: {}", s3_key, e);
                return None;
            }
        };
        let entry: S3CheckCacheEntry = S3CheckCacheEntry {
            s3_key: s3_key.to_string(),
            last_seen_time,
        };
        if entry.last_seen().is_none() {
            log::warn!(
                "Ignoring S3 check cache entry for {} with invalid timestamp '{}'",
                s3_key,
                entry.last_seen_time
            );
            return None;
        }
        if entry.is_expired(Utc::now(), self.max_age) {
            return None;
        }
        Some(entry)
    }

    /// Insert or replace an entry.
    pub fn put_entry(&self, entry: &S3CheckCacheEntry) -> Result<(), CacheError> {
        let Some(db) = self.db.as_ref() else {
            return Ok(());
        };
        db.with_write(|c| {
            c.execute(
                "INSERT OR REPLACE INTO s3checkV1 VALUES(?1, ?2)",
                params![entry.s3_key, entry.last_seen_time],
            )
        })?;
        Ok(())
    }

    /// Whether `bucket`/`key` was confirmed present within the expiry window.
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.get_entry(&cache_key(bucket, key)).is_some()
    }

    /// Record `bucket`/`key` as present now. Errors are logged, not returned.
    pub fn mark_seen(&self, bucket: &str, key: &str) {
        if let Err(e) = self.put_entry(&S3CheckCacheEntry::seen_now(bucket, key)) {
            log::warn!("Failed to record {}/{} in S3 check cache: {}", bucket, key, e);
        }
    }

    pub fn close(&self) {
        if let Some(db) = &self.db {
            db.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mark_seen_then_contains() {
        let dir: TempDir = TempDir::new().unwrap();
        let cache: S3CheckCache = S3CheckCache::try_open(Some(dir.path())).unwrap();

        assert!(!cache.contains("bucket", "Root/Data/abc"));
        cache.mark_seen("bucket", "Root/Data/abc");
        assert!(cache.contains("bucket", "Root/Data/abc"));
        assert!(!cache.contains("other-bucket", "Root/Data/abc"));
        assert!(dir.path().join("s3_check_cache.db").exists());
    }

    #[test]
    fn test_expired_entry_is_ignored() {
        let dir: TempDir = TempDir::new().unwrap();
        let cache: S3CheckCache = S3CheckCache::try_open(Some(dir.path())).unwrap();

        let old: S3CheckCacheEntry =
            S3CheckCacheEntry::seen_at("b", "k", Utc::now() - Duration::days(31));
        cache.put_entry(&old).unwrap();
        assert!(cache.get_entry("b/k").is_none());

        let recent: S3CheckCacheEntry =
            S3CheckCacheEntry::seen_at("b", "k", Utc::now() - Duration::days(1));
        cache.put_entry(&recent).unwrap();
        assert_eq!(cache.get_entry("b/k"), Some(recent));
    }

    #[test]
    fn test_invalid_timestamp_is_ignored() {
        let dir: TempDir = TempDir::new().unwrap();
        let cache: S3CheckCache = S3CheckCache::try_open(Some(dir.path())).unwrap();

        cache
            .put_entry(&S3CheckCacheEntry {
                s3_key: "b/k".into(),
                last_seen_time: "not-a-time".into(),
            })
            .unwrap();
        assert!(cache.get_entry("b/k").is_none());
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let cache: S3CheckCache = S3CheckCache::disabled();
        cache.mark_seen("b", "k");
        assert!(!cache.contains("b", "k"));
    }
}
