//! Pid ledger for running VFS processes.
//!
//! The ledger is `vfs_pids.txt` in the session directory, one
//! `mount_point:pid:manifest_path` line per running mount. The newest
//! entry comes first; a mount point appears at most once.

use std::path::{Path, PathBuf};

use crate::error::VfsError;

/// File name of the ledger inside the session directory.
pub const DEADLINE_VFS_PID_FILE_NAME: &str = "vfs_pids.txt";

/// One running mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidLedgerEntry {
    pub mount_point: String,
    pub pid: u32,
    pub manifest_path: String,
}

impl PidLedgerEntry {
    pub fn new(mount_point: impl Into<String>, pid: u32, manifest_path: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
            pid,
            manifest_path: manifest_path.into(),
        }
    }

    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.splitn(3, ':');
        let mount_point: &str = fields.next()?;
        let pid: u32 = fields.next()?.parse().ok()?;
        let manifest_path: &str = fields.next()?;
        Some(Self::new(mount_point, pid, manifest_path))
    }

    fn to_line(&self) -> String {
        format!("{}:{}:{}", self.mount_point, self.pid, self.manifest_path)
    }
}

/// Reads and rewrites the ledger of one session.
#[derive(Debug, Clone)]
pub struct PidLedger {
    path: PathBuf,
}

impl PidLedger {
    pub fn for_session(session_dir: &Path) -> Self {
        Self {
            path: session_dir.join(DEADLINE_VFS_PID_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// All entries, newest first. A missing ledger is empty.
    pub fn entries(&self) -> Result<Vec<PidLedgerEntry>, VfsError> {
        let content: String = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VfsError::io(&self.path, e)),
        };

        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                PidLedgerEntry::parse(line).ok_or_else(|| VfsError::MalformedLedger {
                    path: self.path.display().to_string(),
                    line: line.to_string(),
                })
            })
            .collect()
    }

    /// Record a new mount, replacing any older entry for the same mount point.
    pub fn record(&self, entry: &PidLedgerEntry) -> Result<(), VfsError> {
        let mut entries: Vec<PidLedgerEntry> = self.entries()?;
        entries.retain(|existing| {
            if existing.mount_point == entry.mount_point {
                log::warn!(
                    "Pid {} entry not removed at {}",
                    existing.pid,
                    existing.mount_point
                );
                false
            } else {
                true
            }
        });
        entries.insert(0, entry.clone());
        self.write(&entries)
    }

    /// Drop the entry for `mount_point`.
    ///
    /// # Returns
    /// The removed entry, if there was one.
    pub fn remove_mount(&self, mount_point: &str) -> Result<Option<PidLedgerEntry>, VfsError> {
        let mut entries: Vec<PidLedgerEntry> = self.entries()?;
        let Some(index) = entries.iter().position(|e| e.mount_point == mount_point) else {
            return Ok(None);
        };
        let removed: PidLedgerEntry = entries.remove(index);
        self.write(&entries)?;
        Ok(Some(removed))
    }

    /// Manifest the mount at `mount_point` was started with.
    pub fn manifest_for_mount(&self, mount_point: &str) -> Result<Option<PathBuf>, VfsError> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|e| e.mount_point == mount_point)
            .map(|e| PathBuf::from(e.manifest_path)))
    }

    pub fn delete(&self) -> Result<(), VfsError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VfsError::io(&self.path, e)),
        }
    }

    fn write(&self, entries: &[PidLedgerEntry]) -> Result<(), VfsError> {
        let mut content: String = String::new();
        for entry in entries {
            content.push_str(&entry.to_line());
            content.push('\n');
        }
        std::fs::write(&self.path, content).map_err(|e| VfsError::io(&self.path, e))
    }
}
