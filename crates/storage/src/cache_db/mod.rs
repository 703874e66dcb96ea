//! SQLite plumbing shared by the hash cache and the S3 check cache.
//!
//! Each thread that touches a cache gets its own connection, opened lazily
//! in WAL mode. Writes additionally take a cross-process [`LockManager`]
//! lock so several processes (or hosts sharing a home directory) can use
//! the same database file.

mod lock;

pub use lock::{LockManager, WriteGuard, DEFAULT_LOCK_ATTEMPTS};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use thiserror::Error;

/// Folder under the home directory holding the cache databases.
pub const DEFAULT_CACHE_DIR: &str = ".deadline/job_attachments";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the local cache databases.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("SQLite error in {path}: {message}")]
    Sqlite { path: String, message: String },

    #[error("Could not create cache directory {path}: {message}")]
    Directory { path: String, message: String },

    #[error("No home directory found for the default cache location")]
    NoHomeDirectory,

    #[error("Could not open cache lock {path}: {message}")]
    Lock { path: String, message: String },

    #[error("Timed out taking cache lock {path} after {attempts} attempts")]
    LockTimeout { path: String, attempts: u32 },
}

/// `~/.deadline/job_attachments`
pub fn default_cache_dir() -> Result<PathBuf, CacheError> {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_CACHE_DIR))
        .ok_or(CacheError::NoHomeDirectory)
}

/// One SQLite database file with per-thread connections.
pub struct CacheDb {
    db_path: PathBuf,
    schema: &'static str,
    connections: Mutex<HashMap<ThreadId, Arc<Mutex<Connection>>>>,
    lock: LockManager,
}

impl CacheDb {
    /// Open `<cache_dir>/<cache_name>.db`, creating the directory and table.
    ///
    /// # Arguments
    /// * `cache_dir` - Directory for the database; `None` uses [`default_cache_dir`]
    /// * `cache_name` - File stem of the database
    /// * `schema` - `CREATE TABLE IF NOT EXISTS ...` run on every new connection
    pub fn open(
        cache_dir: Option<&Path>,
        cache_name: &str,
        schema: &'static str,
    ) -> Result<Self, CacheError> {
        let dir: PathBuf = match cache_dir {
            Some(dir) => dir.to_path_buf(),
            None => default_cache_dir()?,
        };
        std::fs::create_dir_all(&dir).map_err(|e| CacheError::Directory {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;

        let db_path: PathBuf = dir.join(format!("{}.db", cache_name));
        let lock: LockManager = LockManager::new(dir.join(format!("{}.db.lock", cache_name)));
        let db = Self {
            db_path,
            schema,
            connections: Mutex::new(HashMap::new()),
            lock,
        };

        // Surface a broken database now rather than on first use.
        db.connection()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock
    }

    /// Run `f` with this thread's connection.
    pub fn with_connection<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn: Arc<Mutex<Connection>> = self.connection()?;
        let guard = conn.lock();
        f(&guard).map_err(|e| self.sqlite_error(e))
    }

    /// Run `f` with this thread's connection while holding the write lock.
    pub fn with_write<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let _guard: WriteGuard<'_> = self.lock.write_guard()?;
        self.with_connection(f)
    }

    /// Number of open per-thread connections.
    pub fn open_connections(&self) -> usize {
        self.connections.lock().len()
    }

    /// Close every connection this cache opened. Later calls reopen lazily.
    pub fn close(&self) {
        let drained: Vec<Arc<Mutex<Connection>>> =
            self.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in drained {
            if let Ok(mutex) = Arc::try_unwrap(conn) {
                if let Err((_, e)) = mutex.into_inner().close() {
                    log::warn!("Failed to close {}: {}", self.db_path.display(), e);
                }
            }
        }
    }

    fn connection(&self) -> Result<Arc<Mutex<Connection>>, CacheError> {
        let thread_id: ThreadId = std::thread::current().id();
        if let Some(conn) = self.connections.lock().get(&thread_id) {
            return Ok(Arc::clone(conn));
        }

        let conn: Connection = self.new_connection().map_err(|e| self.sqlite_error(e))?;
        let conn: Arc<Mutex<Connection>> = Arc::new(Mutex::new(conn));
        self.connections
            .lock()
            .insert(thread_id, Arc::clone(&conn));
        Ok(conn)
    }

    fn new_connection(&self) -> rusqlite::Result<Connection> {
        let conn: Connection = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(self.schema)?;
        Ok(conn)
    }

    fn sqlite_error(&self, e: rusqlite::Error) -> CacheError {
        CacheError::Sqlite {
            path: self.db_path.display().to_string(),
            message: e.to_string(),
        }
    }
}

impl Drop for CacheDb {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CacheDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDb")
            .field("db_path", &self.db_path)
            .field("open_connections", &self.open_connections())
            .finish()
    }
}
