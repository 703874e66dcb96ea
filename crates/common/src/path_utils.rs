//! Path normalization helpers.
//!
//! Manifests always store POSIX-style paths relative to an asset root, while
//! grouping needs absolute paths that keep symlinks intact. Everything here
//! works lexically except [`resolve_existing_prefix`], which reads the
//! filesystem to follow symlinks before content is written under a root.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use crate::error::PathError;

/// Make a path absolute without resolving symlinks.
///
/// # Errors
/// Returns error if the current directory cannot be determined.
pub fn to_absolute(path: &Path) -> Result<PathBuf, PathError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd: PathBuf| cwd.join(path))
        .map_err(|e: std::io::Error| PathError::from_io(path.display().to_string(), e))
}

/// Resolve `.` and `..` components lexically.
///
/// A `..` directly under the root is dropped, matching how the OS resolves
/// `/..` to `/`.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut components: Vec<Component> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match components.last() {
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                Some(Component::ParentDir) | None => components.push(component),
                Some(_) => {
                    components.pop();
                }
            },
            _ => components.push(component),
        }
    }

    components.iter().collect()
}

/// Express `path` relative to `root` as a POSIX string for a manifest.
///
/// # Errors
/// Returns `PathOutsideDirectory` if the normalized path is not under the root.
pub fn normalize_for_manifest(path: &Path, root: &Path) -> Result<String, PathError> {
    let normalized: PathBuf = lexical_normalize(&to_absolute(path)?);
    let normalized_root: PathBuf = lexical_normalize(&to_absolute(root)?);

    let relative: &Path = normalized.strip_prefix(&normalized_root).map_err(|_| {
        PathError::PathOutsideDirectory {
            path: normalized.display().to_string(),
            directory: normalized_root.display().to_string(),
        }
    })?;

    Ok(to_posix_path(relative))
}

/// Join path components with forward slashes.
pub fn to_posix_path(path: &Path) -> String {
    path.components()
        .filter(|c: &Component| !matches!(c, Component::RootDir))
        .map(|c: Component| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a manifest path onto a destination root using host separators.
///
/// The result is not normalized; pass it through [`is_within_root`]
/// before writing to it.
pub fn from_posix_path(manifest_path: &str, destination_root: &Path) -> PathBuf {
    let mut result: PathBuf = destination_root.to_path_buf();
    for component in manifest_path.split('/').filter(|c| !c.is_empty()) {
        result.push(component);
    }
    result
}

/// Lexical containment check: does `path` stay within `root` once `..` is resolved?
pub fn is_within_root(path: &Path, root: &Path) -> bool {
    lexical_normalize(path).starts_with(lexical_normalize(root))
}

/// Resolve symlinks in the longest existing prefix of `path`.
///
/// Components that do not exist yet are appended to the resolved prefix and
/// normalized lexically. Returns `None` if an existing entry cannot be
/// resolved, e.g. a dangling symlink.
pub fn resolve_existing_prefix(path: &Path) -> Option<PathBuf> {
    let mut existing: &Path = path;
    let mut missing: Vec<&OsStr> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                let mut result: PathBuf = resolved;
                for component in missing.iter().rev() {
                    result.push(component);
                }
                return Some(lexical_normalize(&result));
            }
            Err(_) => {
                if existing.symlink_metadata().is_ok() {
                    return None;
                }
                missing.push(existing.components().next_back()?.as_os_str());
                existing = existing.parent()?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexical_normalize_removes_dot() {
        assert_eq!(
            lexical_normalize(Path::new("/a/./b/./c")),
            PathBuf::from("/a/b/c")
        );
    }

    #[test]
    fn test_lexical_normalize_resolves_dotdot() {
        assert_eq!(
            lexical_normalize(Path::new("/a/b/c/../../d")),
            PathBuf::from("/a/d")
        );
    }

    #[test]
    fn test_lexical_normalize_clamps_at_root() {
        assert_eq!(
            lexical_normalize(Path::new("/a/../../../b")),
            PathBuf::from("/b")
        );
    }

    #[test]
    fn test_lexical_normalize_keeps_leading_dotdot_on_relative() {
        assert_eq!(
            lexical_normalize(Path::new("../x/../y")),
            PathBuf::from("../y")
        );
    }

    #[test]
    fn test_normalize_for_manifest() {
        let rel: String =
            normalize_for_manifest(Path::new("/proj/tex/./wood.png"), Path::new("/proj")).unwrap();
        assert_eq!(rel, "tex/wood.png");

        let err: PathError =
            normalize_for_manifest(Path::new("/other/x"), Path::new("/proj")).unwrap_err();
        assert!(matches!(err, PathError::PathOutsideDirectory { .. }));
    }

    #[test]
    fn test_from_posix_path_skips_empty_components() {
        assert_eq!(
            from_posix_path("a//b/c", Path::new("/root")),
            PathBuf::from("/root/a/b/c")
        );
    }

    #[test]
    fn test_is_within_root() {
        assert!(is_within_root(
            Path::new("/project/assets/file.txt"),
            Path::new("/project")
        ));
        assert!(!is_within_root(Path::new("/etc/passwd"), Path::new("/project")));
        assert!(!is_within_root(
            Path::new("/project/../etc/passwd"),
            Path::new("/project")
        ));
        assert!(!is_within_root(
            Path::new("/project-other/file"),
            Path::new("/project")
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_existing_prefix_follows_symlinks() {
        let root: tempfile::TempDir = tempfile::TempDir::new().unwrap();
        let outside: tempfile::TempDir = tempfile::TempDir::new().unwrap();
        let real_root: PathBuf = root.path().canonicalize().unwrap();
        let real_outside: PathBuf = outside.path().canonicalize().unwrap();
        std::fs::create_dir(root.path().join("dir")).unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();
        std::os::unix::fs::symlink(root.path().join("gone"), root.path().join("dangling")).unwrap();

        assert_eq!(
            resolve_existing_prefix(&root.path().join("dir/new/file.txt")).unwrap(),
            real_root.join("dir/new/file.txt")
        );
        assert_eq!(
            resolve_existing_prefix(&root.path().join("link/sub/file.txt")).unwrap(),
            real_outside.join("sub/file.txt")
        );
        assert_eq!(
            resolve_existing_prefix(&root.path().join("missing/../dir/file.txt")).unwrap(),
            real_root.join("dir/file.txt")
        );
        assert!(resolve_existing_prefix(&root.path().join("dangling/file.txt")).is_none());
    }
}
