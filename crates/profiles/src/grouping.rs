//! Asset path grouping by storage profile locations.
//!
//! Every path handed to a submission lands in exactly one [`AssetRootGroup`]
//! (or is dropped because it lives under a SHARED location). One manifest is
//! later built per group.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use ja_common::{lexical_normalize, to_absolute};
use ja_model::AssetManifest;
use thiserror::Error;

use crate::types::StorageProfile;

/// Paths sharing a common asset root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetRootGroup {
    /// Common path of every member, computed once grouping is final.
    pub root_path: String,
    /// Input files to be hashed and uploaded.
    pub inputs: BTreeSet<PathBuf>,
    /// Output directories (tracked, never uploaded at submission).
    pub outputs: BTreeSet<PathBuf>,
    /// Referenced paths; may not exist.
    pub references: BTreeSet<PathBuf>,
    /// Name of the LOCAL location this group matched, if any.
    pub file_system_location_name: Option<String>,
}

/// Grouped paths plus input totals, ready for hashing.
#[derive(Debug, Clone, Default)]
pub struct AssetUploadGroup {
    pub asset_groups: Vec<AssetRootGroup>,
    pub total_input_files: u64,
    pub total_input_bytes: u64,
}

impl AssetUploadGroup {
    /// Wrap groups, summing input counts and on-disk sizes.
    ///
    /// Inputs that vanished since grouping are logged and left out of the
    /// byte total.
    pub fn from_groups(asset_groups: Vec<AssetRootGroup>) -> Self {
        let mut total_input_files: u64 = 0;
        let mut total_input_bytes: u64 = 0;
        for group in &asset_groups {
            total_input_files += group.inputs.len() as u64;
            for input in &group.inputs {
                match std::fs::metadata(input) {
                    Ok(meta) => total_input_bytes += meta.len(),
                    Err(_) => log::warn!(
                        "Skipping the input from total size calculation as it doesn't exist: {}",
                        input.display()
                    ),
                }
            }
        }
        Self {
            asset_groups,
            total_input_files,
            total_input_bytes,
        }
    }
}

/// Manifest built for one asset root group.
#[derive(Debug, Clone, Default)]
pub struct AssetRootManifest {
    pub root_path: String,
    pub file_system_location_name: Option<String>,
    /// `None` when the group had no input files.
    pub asset_manifest: Option<AssetManifest>,
    pub outputs: Vec<PathBuf>,
}

/// Errors raised while grouping submission paths.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathGroupingError {
    /// Inputs that are missing (when required to exist) or are directories.
    #[error(
        "Job submission contains missing input files or directories specified as files. \
         All inputs must exist and be classified properly.{}",
        format_misconfigured(.missing, .directories)
    )]
    MisconfiguredInputs {
        missing: Vec<String>,
        directories: Vec<String>,
    },
}

fn format_misconfigured(missing: &[String], directories: &[String]) -> String {
    let mut out: String = String::new();
    if !missing.is_empty() {
        out.push_str("\nMissing input files:\n\t");
        out.push_str(&missing.join("\n\t"));
    }
    if !directories.is_empty() {
        out.push_str("\nDirectories classified as files:\n\t");
        out.push_str(&directories.join("\n\t"));
    }
    out
}

/// Group submission paths by asset root.
///
/// Inputs are validated first: directories are always rejected, and missing
/// files are rejected when `require_paths_exist` is set or demoted to
/// references otherwise. Paths under SHARED locations are dropped. Paths
/// under a LOCAL location group by the most specific such location; all other
/// paths group by their top-level component (the filesystem root on POSIX,
/// the drive on Windows).
///
/// # Arguments
/// * `input_paths` - Files to be uploaded
/// * `output_paths` - Output directories
/// * `referenced_paths` - Paths that may not exist
/// * `storage_profile` - Optional storage profile for classification
/// * `require_paths_exist` - Whether missing inputs are an error
///
/// # Returns
/// Groups sorted by root path.
///
/// # Errors
/// `MisconfiguredInputs` listing every offending input, sorted.
pub fn group_asset_paths(
    input_paths: &[PathBuf],
    output_paths: &[PathBuf],
    referenced_paths: &[PathBuf],
    storage_profile: Option<&StorageProfile>,
    require_paths_exist: bool,
) -> Result<Vec<AssetRootGroup>, PathGroupingError> {
    let mut groupings: Groupings = Groupings::default();
    let mut missing: BTreeSet<PathBuf> = BTreeSet::new();
    let mut directories: BTreeSet<PathBuf> = BTreeSet::new();
    let mut references: Vec<PathBuf> = non_empty(referenced_paths).cloned().collect();

    for path in non_empty(input_paths) {
        let abs_path: PathBuf = normalize_path(path);
        if !abs_path.exists() {
            if require_paths_exist {
                missing.insert(abs_path);
            } else {
                log::warn!(
                    "Input path '{}' resolving to '{}' does not exist. Adding to referenced paths.",
                    path.display(),
                    abs_path.display()
                );
                references.push(path.clone());
            }
            continue;
        }
        if abs_path.is_dir() {
            directories.insert(abs_path);
            continue;
        }
        if is_shared(storage_profile, &abs_path) {
            continue;
        }
        groupings.group_for(&abs_path, storage_profile).inputs.insert(abs_path);
    }

    if !missing.is_empty() || !directories.is_empty() {
        return Err(PathGroupingError::MisconfiguredInputs {
            missing: missing.iter().map(|p| p.display().to_string()).collect(),
            directories: directories.iter().map(|p| p.display().to_string()).collect(),
        });
    }

    for path in non_empty(output_paths) {
        let abs_path: PathBuf = normalize_path(path);
        if is_shared(storage_profile, &abs_path) {
            continue;
        }
        groupings.group_for(&abs_path, storage_profile).outputs.insert(abs_path);
    }

    for path in references.iter() {
        let abs_path: PathBuf = normalize_path(path);
        if is_shared(storage_profile, &abs_path) {
            continue;
        }
        groupings.group_for(&abs_path, storage_profile).references.insert(abs_path);
    }

    let mut groups: Vec<AssetRootGroup> = groupings.finish();
    groups.sort_by(|a, b| {
        a.root_path
            .cmp(&b.root_path)
            .then_with(|| a.file_system_location_name.cmp(&b.file_system_location_name))
    });
    Ok(groups)
}

/// Groups keyed by LOCAL location path or top-level component.
#[derive(Default)]
struct Groupings {
    groups: HashMap<String, AssetRootGroup>,
}

impl Groupings {
    fn group_for(
        &mut self,
        abs_path: &Path,
        storage_profile: Option<&StorageProfile>,
    ) -> &mut AssetRootGroup {
        if let Some(location) = storage_profile.and_then(|p| p.find_local_location(abs_path)) {
            return self
                .groups
                .entry(location.path.clone())
                .or_insert_with(|| AssetRootGroup {
                    file_system_location_name: Some(location.name.clone()),
                    ..Default::default()
                });
        }

        let top_directory: String = abs_path
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .unwrap_or_default();
        let existing: Option<String> = self
            .groups
            .keys()
            .find(|k| normcase(k) == normcase(&top_directory))
            .cloned();
        let key: String = existing.unwrap_or(top_directory);
        self.groups.entry(key).or_default()
    }

    fn finish(self) -> Vec<AssetRootGroup> {
        self.groups
            .into_values()
            .map(|mut group| {
                let members: Vec<&Path> = group
                    .inputs
                    .iter()
                    .chain(group.outputs.iter())
                    .chain(group.references.iter())
                    .map(|p| p.as_path())
                    .collect();
                if let Some(common) = common_path(&members) {
                    let root: &Path = if common.is_file() {
                        common.parent().unwrap_or(&common)
                    } else {
                        &common
                    };
                    group.root_path = root.to_string_lossy().into_owned();
                }
                group
            })
            .collect()
    }
}

fn non_empty(paths: &[PathBuf]) -> impl Iterator<Item = &PathBuf> {
    paths.iter().filter(|p| !p.as_os_str().is_empty())
}

fn is_shared(storage_profile: Option<&StorageProfile>, abs_path: &Path) -> bool {
    storage_profile.is_some_and(|p| p.is_shared(abs_path))
}

/// Absolute without resolving symlinks, with `.` and `..` removed.
fn normalize_path(path: &Path) -> PathBuf {
    let abs: PathBuf = to_absolute(path).unwrap_or_else(|_| path.to_path_buf());
    lexical_normalize(&abs)
}

#[cfg(windows)]
fn normcase(s: &str) -> String {
    s.to_lowercase().replace('/', "\\")
}

#[cfg(not(windows))]
fn normcase(s: &str) -> String {
    s.to_string()
}

/// Longest common component prefix of a set of absolute paths.
fn common_path(paths: &[&Path]) -> Option<PathBuf> {
    let (first, rest): (&&Path, &[&Path]) = paths.split_first()?;
    let first_components: Vec<_> = first.components().collect();
    let mut common_count: usize = first_components.len();

    for path in rest {
        let matching: usize = first_components
            .iter()
            .zip(path.components())
            .take_while(|(a, b)| **a == *b)
            .count();
        common_count = common_count.min(matching);
    }

    if common_count == 0 {
        return None;
    }
    Some(first_components[..common_count].iter().collect())
}
