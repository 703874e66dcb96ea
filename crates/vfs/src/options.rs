//! Launch configuration for one VFS mount.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Seconds to wait for a mount to appear or disappear.
pub const DEFAULT_MOUNT_WAIT: Duration = Duration::from_secs(60);

/// Object cache shared by the mounts of one session.
pub const VFS_CACHE_REL_PATH_IN_SESSION: &str = ".vfs_object_cache";
/// Manifests handed to each mount process.
pub const VFS_MANIFEST_FOLDER_IN_SESSION: &str = ".vfs_manifests";
/// Log output of the mount processes.
pub const VFS_LOGS_FOLDER_IN_SESSION: &str = ".vfs_logs";

/// Everything the `deadline_vfs` process needs to serve one manifest.
///
/// # Example
///
/// ```ignore
/// let options = VfsLaunchOptions::new("bucket", "us-west-2", manifest, mount_point, "job-user")
///     .with_os_group(Some("job-group".into()))
///     .with_cas_prefix(Some("Root/Data".into()));
/// ```
#[derive(Debug, Clone)]
pub struct VfsLaunchOptions {
    pub bucket: String,
    pub region: String,
    /// Manifest file describing the mounted tree.
    pub manifest_path: PathBuf,
    pub mount_point: PathBuf,
    /// User the process runs as.
    pub os_user: String,
    /// Group granted read access to the manifest.
    pub os_group: Option<String>,
    /// Environment passed to the process, before VFS additions.
    pub os_env_vars: HashMap<String, String>,
    pub cas_prefix: Option<String>,
    /// Local object cache directory.
    pub cache_dir: Option<PathBuf>,
    pub mount_wait: Duration,
}

impl VfsLaunchOptions {
    pub fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        manifest_path: impl Into<PathBuf>,
        mount_point: impl Into<PathBuf>,
        os_user: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            manifest_path: manifest_path.into(),
            mount_point: mount_point.into(),
            os_user: os_user.into(),
            os_group: None,
            os_env_vars: HashMap::new(),
            cas_prefix: None,
            cache_dir: None,
            mount_wait: DEFAULT_MOUNT_WAIT,
        }
    }

    pub fn with_os_group(mut self, os_group: Option<String>) -> Self {
        self.os_group = os_group;
        self
    }

    pub fn with_env_vars(mut self, os_env_vars: HashMap<String, String>) -> Self {
        self.os_env_vars = os_env_vars;
        self
    }

    pub fn with_cas_prefix(mut self, cas_prefix: Option<String>) -> Self {
        self.cas_prefix = cas_prefix;
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: Option<PathBuf>) -> Self {
        self.cache_dir = cache_dir;
        self
    }

    /// How long `start` waits for the mount to appear.
    pub fn with_mount_wait(mut self, mount_wait: Duration) -> Self {
        self.mount_wait = mount_wait;
        self
    }
}
