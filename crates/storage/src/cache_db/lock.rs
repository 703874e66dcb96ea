//! Cross-process write lock for cache databases.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fslock::LockFile;
use parking_lot::Mutex;
use rand::Rng;

use super::CacheError;

/// Attempts made to take the file lock before giving up.
pub const DEFAULT_LOCK_ATTEMPTS: u32 = 10;

/// Upper bound of the first randomized backoff; doubles per attempt.
const BASE_BACKOFF_MS: u64 = 50;

#[derive(Default)]
struct LockState {
    holders: usize,
    file: Option<LockFile>,
}

/// Reference-counted advisory lock on a file next to the database.
///
/// The OS lock is taken when the first writer in this process arrives and
/// released when the last one leaves, so threads of one process pay for it
/// once. Readers never take it.
pub struct LockManager {
    lock_path: PathBuf,
    max_attempts: u32,
    state: Mutex<LockState>,
}

impl LockManager {
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: lock_path.into(),
            max_attempts: DEFAULT_LOCK_ATTEMPTS,
            state: Mutex::new(LockState::default()),
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Number of writers currently holding the lock in this process.
    pub fn holders(&self) -> usize {
        self.state.lock().holders
    }

    /// Register a writer, taking the file lock if this is the first one.
    ///
    /// # Errors
    /// `LockTimeout` when another process holds the lock for every attempt.
    pub fn acquire_write(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        if state.holders == 0 {
            state.file = Some(self.lock_with_retry()?);
        }
        state.holders += 1;
        Ok(())
    }

    /// Unregister a writer, releasing the file lock when none remain.
    pub fn release_write(&self) {
        let mut state = self.state.lock();
        if state.holders == 0 {
            return;
        }
        state.holders -= 1;
        if state.holders == 0 {
            if let Some(mut file) = state.file.take() {
                if let Err(e) = file.unlock() {
                    log::warn!("Failed to unlock {}: {}", self.lock_path.display(), e);
                }
            }
        }
    }

    /// [`acquire_write`](Self::acquire_write) returning a guard that releases on drop.
    pub fn write_guard(&self) -> Result<WriteGuard<'_>, CacheError> {
        self.acquire_write()?;
        Ok(WriteGuard { manager: self })
    }

    fn lock_with_retry(&self) -> Result<LockFile, CacheError> {
        let mut file: LockFile = LockFile::open(&self.lock_path).map_err(|e| CacheError::Lock {
            path: self.lock_path.display().to_string(),
            message: e.to_string(),
        })?;

        let mut rng = rand::thread_rng();
        for attempt in 0..self.max_attempts {
            let acquired: bool = file.try_lock().map_err(|e| CacheError::Lock {
                path: self.lock_path.display().to_string(),
                message: e.to_string(),
            })?;
            if acquired {
                return Ok(file);
            }

            let ceiling: u64 = BASE_BACKOFF_MS << attempt.min(6);
            let delay: Duration = Duration::from_millis(rng.gen_range(1..=ceiling));
            log::debug!(
                "Cache lock {} busy (attempt {}/{}), retrying in {:?}",
                self.lock_path.display(),
                attempt + 1,
                self.max_attempts,
                delay
            );
            std::thread::sleep(delay);
        }

        Err(CacheError::LockTimeout {
            path: self.lock_path.display().to_string(),
            attempts: self.max_attempts,
        })
    }
}

/// Holds one write registration on a [`LockManager`].
pub struct WriteGuard<'a> {
    manager: &'a LockManager,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.manager.release_write();
    }
}
