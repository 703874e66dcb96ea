//! Mount state checks.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::options::VFS_LOGS_FOLDER_IN_SESSION;

const MOUNT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const LOG_TAIL_LINES: usize = 100;

/// Whether `path` is a mount point.
///
/// Uses `findmnt`, which also sees FUSE mounts owned by other users. A
/// missing `findmnt` reads as "not mounted".
pub async fn is_mount(path: &Path) -> bool {
    Command::new("findmnt")
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Poll once a second until the mount state of `mount_path` is `expected`.
///
/// On timeout the tail of the session's VFS log is logged.
///
/// # Returns
/// Whether the expected state was reached within `wait`.
pub async fn wait_for_mount(
    mount_path: &Path,
    session_dir: &Path,
    wait: Duration,
    expected: bool,
) -> bool {
    log::info!(
        "Waiting for is_mount at {} to return {}..",
        mount_path.display(),
        expected
    );
    let mut remaining: i64 = wait.as_secs() as i64;
    while remaining >= 0 {
        if is_mount(mount_path).await == expected {
            log::info!(
                "is_mount on {} returns {}, returning",
                mount_path.display(),
                expected
            );
            return true;
        }
        remaining -= 1;
        if remaining >= 0 {
            tokio::time::sleep(MOUNT_POLL_INTERVAL).await;
        }
    }

    log::info!(
        "Failed to find is_mount {} at {} after {}s",
        expected,
        mount_path.display(),
        wait.as_secs()
    );
    log_vfs_log_tail(session_dir, LOG_TAIL_LINES);
    false
}

/// Log the last `lines` lines of the session's VFS log as warnings.
pub fn log_vfs_log_tail(session_dir: &Path, lines: usize) {
    let log_path = session_dir
        .join(VFS_LOGS_FOLDER_IN_SESSION)
        .join("vfs_log.txt");
    log::warn!("Printing last {} lines from {}", lines, log_path.display());
    match std::fs::read_to_string(&log_path) {
        Ok(content) => {
            let all: Vec<&str> = content.lines().collect();
            for line in &all[all.len().saturating_sub(lines)..] {
                log::warn!("{}", line);
            }
        }
        Err(_) => log::warn!("No log file found at {}", log_path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_plain_directory_is_not_a_mount() {
        let dir: TempDir = TempDir::new().unwrap();
        let sub = dir.path().join("plain");
        std::fs::create_dir(&sub).unwrap();
        assert!(!is_mount(&sub).await);
    }

    #[tokio::test]
    async fn test_wait_for_unmounted_returns_immediately() {
        let dir: TempDir = TempDir::new().unwrap();
        let sub = dir.path().join("plain");
        std::fs::create_dir(&sub).unwrap();
        assert!(wait_for_mount(&sub, dir.path(), Duration::from_secs(5), false).await);
    }

    #[tokio::test]
    async fn test_wait_for_mount_times_out() {
        let dir: TempDir = TempDir::new().unwrap();
        let sub = dir.path().join("plain");
        std::fs::create_dir(&sub).unwrap();
        assert!(!wait_for_mount(&sub, dir.path(), Duration::ZERO, true).await);
    }
}
