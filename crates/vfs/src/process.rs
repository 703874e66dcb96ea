//! Launching one `deadline_vfs` mount process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::error::VfsError;
use crate::install::{VfsInstallation, DEADLINE_VFS_CACHE_ENV_VAR};
use crate::ledger::{PidLedger, PidLedgerEntry};
use crate::mount::wait_for_mount;
use crate::options::VfsLaunchOptions;

/// Group read, owner read/write.
pub const DEADLINE_MANIFEST_GROUP_READ_PERMS: u32 = 0o640;

/// Starts a mount process for one manifest and records it in the session ledger.
pub struct VfsProcessManager {
    installation: VfsInstallation,
    options: VfsLaunchOptions,
    pid: Option<u32>,
}

impl VfsProcessManager {
    pub fn new(installation: VfsInstallation, options: VfsLaunchOptions) -> Self {
        Self {
            installation,
            options,
            pid: None,
        }
    }

    pub fn mount_point(&self) -> &Path {
        &self.options.mount_point
    }

    /// Pid of the launched process, once started.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Full argument vector, starting with `sudo`.
    ///
    /// The mount point must be the first argument the executable sees.
    pub fn launch_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "sudo".into(),
            "-E".into(),
            "-u".into(),
            self.options.os_user.clone(),
            self.installation.executable().display().to_string(),
            self.options.mount_point.display().to_string(),
            "-f".into(),
            "--clienttype=deadline".into(),
            format!("--bucket={}", self.options.bucket),
            format!("--manifest={}", self.options.manifest_path.display()),
            format!("--region={}", self.options.region),
            "-oallow_other".into(),
        ];
        if let Some(cas_prefix) = &self.options.cas_prefix {
            args.push(format!("--casprefix={}", cas_prefix));
        }
        if let Some(cache_dir) = &self.options.cache_dir {
            args.push(format!("--cachedir={}", cache_dir.display()));
        }
        args
    }

    /// Caller environment plus the VFS `PATH`, library path and cache override.
    pub fn launch_environment(&self) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = self.options.os_env_vars.clone();
        let inherited_path: String = std::env::var("PATH").unwrap_or_default();
        let separator: &str = if cfg!(windows) { ";" } else { ":" };
        env.insert(
            "PATH".into(),
            format!(
                "{}{}{}",
                self.installation.link_dir().display(),
                separator,
                inherited_path
            ),
        );
        env.insert(
            "LD_LIBRARY_PATH".into(),
            self.installation.library_dir().display().to_string(),
        );
        if let Ok(cache) = std::env::var(DEADLINE_VFS_CACHE_ENV_VAR) {
            env.insert(DEADLINE_VFS_CACHE_ENV_VAR.into(), cache);
        }
        env
    }

    /// Launch the process, wait for the mount, and record it in the ledger.
    ///
    /// # Returns
    /// The pid of the mount process.
    ///
    /// # Errors
    /// `Spawn` if the process cannot start, `FailedToMount` if the mount
    /// does not appear within the configured wait.
    pub async fn start(&mut self, session_dir: &Path) -> Result<u32, VfsError> {
        if !cfg!(unix) {
            return Err(VfsError::Unsupported);
        }
        log::info!("Using run_path {}", session_dir.display());
        log::info!("Using mount_point {}", self.mount_point().display());

        self.set_manifest_owner()?;
        create_mount_point(self.mount_point())?;

        let args: Vec<String> = self.launch_args();
        let command_line: String = args.join(" ");
        log::info!("Launching VFS with command {}", command_line);
        log::info!("Launching as user {}", self.options.os_user);

        let mut child: Child = Command::new(&args[0])
            .args(&args[1..])
            .env_clear()
            .envs(self.launch_environment())
            .current_dir(session_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| VfsError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        let pid: u32 = child.id().ok_or_else(|| VfsError::FailedToMount {
            mount_point: self.mount_point().display().to_string(),
        })?;
        log::info!("Launched VFS as pid {}", pid);
        self.pid = Some(pid);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr));
        }
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => log::info!("VFS process {} exited with {}", pid, status),
                Err(e) => log::warn!("Failed waiting on VFS process {}: {}", pid, e),
            }
        });

        if !wait_for_mount(
            self.mount_point(),
            session_dir,
            self.options.mount_wait,
            true,
        )
        .await
        {
            log::error!("Failed to mount, shutting down");
            return Err(VfsError::FailedToMount {
                mount_point: self.mount_point().display().to_string(),
            });
        }

        PidLedger::for_session(session_dir).record(&PidLedgerEntry::new(
            self.mount_point().to_string_lossy(),
            pid,
            self.options.manifest_path.to_string_lossy(),
        ))?;
        Ok(pid)
    }

    /// Give the job user's group read access to the manifest.
    fn set_manifest_owner(&self) -> Result<(), VfsError> {
        let manifest: &Path = &self.options.manifest_path;
        if !manifest.exists() {
            log::error!("Manifest not found at {}", manifest.display());
            return Ok(());
        }
        let Some(group) = &self.options.os_group else {
            return Ok(());
        };
        log::info!(
            "Attempting to set group ownership on {} for {} to {}",
            manifest.display(),
            self.options.os_user,
            group
        );
        set_group_readable(manifest, group)
    }
}

async fn forward_output<R: AsyncRead + Unpin>(pipe: R) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log::info!("{}", line.trim()),
            Ok(None) => break,
            Err(e) => {
                log::warn!("Error reading VFS output: {}", e);
                break;
            }
        }
    }
}

/// Create the mount directory, world-accessible, if it does not exist.
fn create_mount_point(mount_point: &Path) -> Result<(), VfsError> {
    if mount_point.exists() {
        return Ok(());
    }
    log::info!("Creating mount point at {}", mount_point.display());
    std::fs::create_dir_all(mount_point).map_err(|e| VfsError::io(mount_point, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(mount_point, std::fs::Permissions::from_mode(0o777))
            .map_err(|e| VfsError::io(mount_point, e))?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_group_readable(path: &Path, group: &str) -> Result<(), VfsError> {
    use nix::unistd::{chown, Group};
    use std::os::unix::fs::PermissionsExt;

    let unknown_group = || {
        VfsError::io(
            path,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("group '{}' not found", group),
            ),
        )
    };
    let gid = Group::from_name(group)
        .map_err(|e| VfsError::io(path, std::io::Error::from(e)))?
        .ok_or_else(unknown_group)?
        .gid;
    chown(path, None, Some(gid)).map_err(|e| VfsError::io(path, std::io::Error::from(e)))?;
    std::fs::set_permissions(
        path,
        std::fs::Permissions::from_mode(DEADLINE_MANIFEST_GROUP_READ_PERMS),
    )
    .map_err(|e| VfsError::io(path, e))
}

#[cfg(not(unix))]
fn set_group_readable(_path: &Path, _group: &str) -> Result<(), VfsError> {
    Err(VfsError::Unsupported)
}
