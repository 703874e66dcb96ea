//! S3 check cache entry type.

use chrono::{DateTime, Duration, Utc};

/// Record that an object was confirmed present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3CheckCacheEntry {
    /// `"{bucket}/{key}"`.
    pub s3_key: String,
    /// Epoch seconds as a decimal string, e.g. `"1700000000.123456"`.
    pub last_seen_time: String,
}

impl S3CheckCacheEntry {
    /// Entry for `bucket`/`key` seen now.
    pub fn seen_now(bucket: &str, key: &str) -> Self {
        Self::seen_at(bucket, key, Utc::now())
    }

    pub fn seen_at(bucket: &str, key: &str, when: DateTime<Utc>) -> Self {
        let seconds: f64 = when.timestamp_micros() as f64 / 1_000_000.0;
        Self {
            s3_key: cache_key(bucket, key),
            last_seen_time: format!("{:.6}", seconds),
        }
    }

    /// Parsed `last_seen_time`, or `None` if it is not a number.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        let seconds: f64 = self.last_seen_time.trim().parse().ok()?;
        DateTime::<Utc>::from_timestamp_micros((seconds * 1_000_000.0) as i64)
    }

    /// Whether the entry is older than `max_age` as of `now`.
    ///
    /// Unparseable timestamps count as expired.
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match self.last_seen() {
            Some(seen) => now - seen > max_age,
            None => true,
        }
    }
}

/// Cache key for an object: `"{bucket}/{key}"`.
pub fn cache_key(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, key)
}
