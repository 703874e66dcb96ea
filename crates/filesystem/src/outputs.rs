//! Output directory scanning.
//!
//! Finds the files a session action produced under an asset root's output
//! directories so they can be hashed into an output manifest.

use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use ja_common::{human_readable_file_size, is_within_root, normalize_for_manifest};
use ja_model::PathFormat;
use walkdir::WalkDir;

use crate::error::FileSystemError;
use crate::hashing::modified_time_us;

/// Where to look for outputs and what counts as new.
#[derive(Debug, Clone)]
pub struct OutputScanOptions {
    /// Local asset root the output directories are relative to.
    pub root: PathBuf,
    /// Output directories as recorded at submission.
    pub output_relative_directories: Vec<String>,
    /// Path format the directories were recorded in.
    pub source_path_format: PathFormat,
    /// Files modified at or after this time (microseconds) are outputs.
    pub start_time_us: i64,
}

/// A file selected for upload as output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    /// Path as found under the output directory.
    pub path: PathBuf,
    /// POSIX path relative to the asset root.
    pub relative_path: String,
    pub size: u64,
    pub mtime_us: i64,
}

/// Convert `directory` from `source` separators to the host's.
pub fn convert_path_separators(directory: &str, source: PathFormat) -> String {
    let host: PathFormat = PathFormat::host();
    if source == host {
        directory.to_string()
    } else {
        directory.replace(source.separator(), &host.separator().to_string())
    }
}

/// Walk the output directories and collect new or modified files.
///
/// A file is selected if its modification time is at or after
/// `start_time_us`, or if it differs from the time recorded in
/// `synced_mtimes` (keyed by path string) when inputs were synced. Files
/// whose resolved path leaves the root, e.g. through a symlink, are skipped.
/// Missing output directories are not an error.
///
/// # Errors
/// `IoError` if a directory cannot be read or a file cannot be stat'ed.
pub fn find_output_files(
    options: &OutputScanOptions,
    synced_mtimes: &HashMap<String, i64>,
) -> Result<Vec<OutputFile>, FileSystemError> {
    let real_root: PathBuf = options
        .root
        .canonicalize()
        .map_err(|e| FileSystemError::io(&options.root, e))?;
    let mut output_files: Vec<OutputFile> = Vec::new();

    for output_dir in &options.output_relative_directories {
        let output_root: PathBuf = options
            .root
            .join(convert_path_separators(output_dir, options.source_path_format));

        if !output_root.is_dir() {
            log::info!(
                "Found 0 files (Output directory {} does not exist.)",
                output_root.display()
            );
            continue;
        }

        let mut file_count: u64 = 0;
        let mut total_size: u64 = 0;

        for entry in WalkDir::new(&output_root).follow_links(false) {
            let entry: walkdir::DirEntry = entry.map_err(|e| FileSystemError::IoError {
                path: e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                source: e.into(),
            })?;
            if entry.file_type().is_dir() {
                continue;
            }

            let path: &Path = entry.path();
            let real_path: PathBuf = match path.canonicalize() {
                Ok(real_path) => real_path,
                Err(e) => {
                    log::warn!("Skipping unresolvable output {}: {}", path.display(), e);
                    continue;
                }
            };
            if !is_within_root(&real_path, &real_root) {
                log::info!(
                    "Skipping file '{}' as its resolved path '{}' is outside the root '{}'",
                    path.display(),
                    real_path.display(),
                    real_root.display()
                );
                continue;
            }

            let metadata: Metadata =
                std::fs::metadata(&real_path).map_err(|e| FileSystemError::io(path, e))?;
            if !metadata.is_file() {
                continue;
            }
            let mtime_us: i64 =
                modified_time_us(&metadata).map_err(|e| FileSystemError::io(path, e))?;

            let recorded: Option<i64> = synced_mtimes.get(&*path.to_string_lossy()).copied();
            let modified: bool =
                mtime_us >= options.start_time_us || recorded.is_some_and(|r| r != mtime_us);
            if !modified {
                continue;
            }

            file_count += 1;
            total_size += metadata.len();
            output_files.push(OutputFile {
                path: path.to_path_buf(),
                relative_path: normalize_for_manifest(path, &options.root)?,
                size: metadata.len(),
                mtime_us,
            });
        }

        log::info!(
            "Found {} file{} totaling {} in output directory: {}",
            file_count,
            if file_count == 1 { "" } else { "s" },
            human_readable_file_size(total_size),
            output_root.display()
        );
    }

    Ok(output_files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::TempDir;

    const START_US: i64 = 1_700_000_000_000_000;

    fn write_at(root: &Path, rel: &str, secs: i64) -> PathBuf {
        let path: PathBuf = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"data").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(secs, 0)).unwrap();
        path
    }

    fn options(root: &Path, dirs: &[&str]) -> OutputScanOptions {
        OutputScanOptions {
            root: root.to_path_buf(),
            output_relative_directories: dirs.iter().map(|d| d.to_string()).collect(),
            source_path_format: PathFormat::host(),
            start_time_us: START_US,
        }
    }

    #[test]
    fn test_selects_files_written_after_start() {
        let root: TempDir = TempDir::new().unwrap();
        write_at(root.path(), "out/old.exr", 1_600_000_000);
        write_at(root.path(), "out/frames/new.exr", 1_800_000_000);

        let files: Vec<OutputFile> =
            find_output_files(&options(root.path(), &["out"]), &HashMap::new()).unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "out/frames/new.exr");
        assert_eq!(files[0].size, 4);
        assert_eq!(files[0].mtime_us, 1_800_000_000_000_000);
    }

    #[test]
    fn test_selects_synced_file_whose_mtime_changed() {
        let root: TempDir = TempDir::new().unwrap();
        let touched: PathBuf = write_at(root.path(), "out/touched.txt", 1_600_000_100);
        let untouched: PathBuf = write_at(root.path(), "out/untouched.txt", 1_600_000_000);

        let synced: HashMap<String, i64> = HashMap::from([
            (touched.to_string_lossy().into_owned(), 1_600_000_000_000_000),
            (untouched.to_string_lossy().into_owned(), 1_600_000_000_000_000),
        ]);
        let files: Vec<OutputFile> =
            find_output_files(&options(root.path(), &["out"]), &synced).unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "out/touched.txt");
    }

    #[test]
    fn test_missing_output_directory_is_empty() {
        let root: TempDir = TempDir::new().unwrap();
        let files: Vec<OutputFile> =
            find_output_files(&options(root.path(), &["not-yet"]), &HashMap::new()).unwrap();
        assert!(files.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escaping_root_is_skipped() {
        let root: TempDir = TempDir::new().unwrap();
        let outside: TempDir = TempDir::new().unwrap();
        let target: PathBuf = write_at(outside.path(), "secret.txt", 1_800_000_000);
        std::fs::create_dir_all(root.path().join("out")).unwrap();
        std::os::unix::fs::symlink(&target, root.path().join("out/link.txt")).unwrap();
        write_at(root.path(), "out/real.txt", 1_800_000_000);

        let files: Vec<OutputFile> =
            find_output_files(&options(root.path(), &["out"]), &HashMap::new()).unwrap();

        let names: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["out/real.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_windows_directories_are_converted() {
        assert_eq!(
            convert_path_separators("renders\\beauty", PathFormat::Windows),
            "renders/beauty"
        );
        assert_eq!(convert_path_separators("renders/beauty", PathFormat::Posix), "renders/beauty");

        let root: TempDir = TempDir::new().unwrap();
        write_at(root.path(), "renders/beauty/f1.exr", 1_800_000_000);
        let mut opts: OutputScanOptions = options(root.path(), &["renders\\beauty"]);
        opts.source_path_format = PathFormat::Windows;

        let files: Vec<OutputFile> = find_output_files(&opts, &HashMap::new()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "renders/beauty/f1.exr");
    }
}
