//! Storage profile data structures.

use std::path::Path;

use ja_model::PathFormat;
use serde::{Deserialize, Serialize};

/// Classification of a file system location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileSystemLocationType {
    /// Files are local to the submitter and must be uploaded.
    Local,
    /// Files are on shared storage accessible to workers (never uploaded).
    Shared,
}

/// A named file system location with a root path and type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemLocation {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub location_type: FileSystemLocationType,
}

impl FileSystemLocation {
    pub fn local(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            location_type: FileSystemLocationType::Local,
        }
    }

    pub fn shared(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            location_type: FileSystemLocationType::Shared,
        }
    }
}

/// Operating system family a storage profile was written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageProfileOsFamily {
    Windows,
    Linux,
    Macos,
}

impl StorageProfileOsFamily {
    /// Path format used by hosts of this family.
    pub fn path_format(&self) -> PathFormat {
        match self {
            Self::Windows => PathFormat::Windows,
            Self::Linux | Self::Macos => PathFormat::Posix,
        }
    }
}

/// A storage profile: the set of named locations a queue or fleet knows about.
///
/// Field names follow the service's camelCase JSON so a profile fetched from
/// the control plane can be deserialized directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageProfile {
    #[serde(default)]
    pub storage_profile_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_family: Option<StorageProfileOsFamily>,
    #[serde(default)]
    pub file_system_locations: Vec<FileSystemLocation>,
}

impl StorageProfile {
    /// Create a storage profile with the given locations.
    ///
    /// # Arguments
    /// * `locations` - File system locations to include
    pub fn with_locations(locations: Vec<FileSystemLocation>) -> Self {
        Self {
            file_system_locations: locations,
            ..Default::default()
        }
    }

    /// Locations of the given type, in declaration order.
    pub fn locations_of_type(
        &self,
        location_type: FileSystemLocationType,
    ) -> impl Iterator<Item = &FileSystemLocation> {
        self.file_system_locations
            .iter()
            .filter(move |loc| loc.location_type == location_type)
    }

    /// Check if a path is under any SHARED location.
    pub fn is_shared(&self, path: &Path) -> bool {
        self.locations_of_type(FileSystemLocationType::Shared)
            .any(|loc| path.starts_with(&loc.path))
    }

    /// Find the most specific LOCAL location containing a path.
    ///
    /// Overlapping locations resolve to the one with the longest path.
    ///
    /// # Returns
    /// The matching location, or `None` if the path is under no LOCAL location.
    pub fn find_local_location(&self, path: &Path) -> Option<&FileSystemLocation> {
        self.locations_of_type(FileSystemLocationType::Local)
            .filter(|loc| path.starts_with(&loc.path))
            .max_by_key(|loc| loc.path.len())
    }
}

/// Maps a root path recorded at submission onto a path on the executing host.
///
/// Keys are snake_case to match the rule files job runtimes consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMappingRule {
    pub source_path_format: PathFormat,
    pub source_path: String,
    pub destination_path: String,
}

impl PathMappingRule {
    pub fn new(
        source_path_format: PathFormat,
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
    ) -> Self {
        Self {
            source_path_format,
            source_path: source_path.into(),
            destination_path: destination_path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_profile() -> StorageProfile {
        StorageProfile::with_locations(vec![
            FileSystemLocation::local("ProjectFiles", "/mnt/projects"),
            FileSystemLocation::shared("SharedAssets", "/mnt/shared"),
            FileSystemLocation::local("DeepLocal", "/mnt/projects/deep/nested"),
        ])
    }

    #[test]
    fn test_is_shared() {
        let profile: StorageProfile = create_test_profile();

        assert!(profile.is_shared(Path::new("/mnt/shared/file.txt")));
        assert!(profile.is_shared(Path::new("/mnt/shared/deep/file.txt")));
        assert!(!profile.is_shared(Path::new("/mnt/projects/file.txt")));
        assert!(!profile.is_shared(Path::new("/mnt/sharedother/file.txt")));
    }

    #[test]
    fn test_find_local_location_most_specific() {
        let profile: StorageProfile = create_test_profile();

        let nested: Option<&FileSystemLocation> =
            profile.find_local_location(Path::new("/mnt/projects/deep/nested/file.txt"));
        assert_eq!(nested.map(|l| l.name.as_str()), Some("DeepLocal"));

        let parent: Option<&FileSystemLocation> =
            profile.find_local_location(Path::new("/mnt/projects/other/file.txt"));
        assert_eq!(parent.map(|l| l.name.as_str()), Some("ProjectFiles"));

        assert!(profile
            .find_local_location(Path::new("/other/file.txt"))
            .is_none());
    }

    #[test]
    fn test_profile_deserializes_service_json() {
        let json: &str = r#"{
            "storageProfileId": "sp-123",
            "displayName": "Linux workstation",
            "osFamily": "LINUX",
            "fileSystemLocations": [
                {"name": "Projects", "path": "/mnt/projects", "type": "LOCAL"},
                {"name": "Library", "path": "/mnt/library", "type": "SHARED"}
            ]
        }"#;
        let profile: StorageProfile = serde_json::from_str(json).unwrap();

        assert_eq!(profile.storage_profile_id, "sp-123");
        assert_eq!(profile.os_family, Some(StorageProfileOsFamily::Linux));
        assert_eq!(
            profile
                .locations_of_type(FileSystemLocationType::Shared)
                .count(),
            1
        );
        assert_eq!(
            profile.os_family.map(|f| f.path_format()),
            Some(PathFormat::Posix)
        );
    }

    #[test]
    fn test_path_mapping_rule_json_keys() {
        let rule: PathMappingRule = PathMappingRule::new(
            PathFormat::Windows,
            "C:\\projects",
            "/sessions/assetroot-abc",
        );
        let json: String = serde_json::to_string(&rule).unwrap();

        assert_eq!(
            json,
            r#"{"source_path_format":"windows","source_path":"C:\\projects","destination_path":"/sessions/assetroot-abc"}"#
        );
    }
}
