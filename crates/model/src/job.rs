//! Job-level attachment records.
//!
//! These are produced at submission time, stored with the job, and read
//! back by workers. Field names follow the service's camelCase JSON.

use serde::{Deserialize, Serialize};

/// Operating system family a root path was written on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathFormat {
    Windows,
    Posix,
}

impl PathFormat {
    /// Path format of the running host.
    pub fn host() -> Self {
        if cfg!(windows) {
            PathFormat::Windows
        } else {
            PathFormat::Posix
        }
    }

    pub fn separator(&self) -> char {
        match self {
            PathFormat::Windows => '\\',
            PathFormat::Posix => '/',
        }
    }
}

/// How job inputs reach the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileSystemAccessMode {
    /// Download every file into the session directory.
    #[default]
    Copied,
    /// Mount a virtual filesystem that fetches content on demand.
    Virtual,
}

/// Per-root record stored with a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestProperties {
    pub root_path: String,
    pub root_path_format: PathFormat,
    /// Storage profile location this root belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_system_location_name: Option<String>,
    /// Manifest key relative to `<rootPrefix>/Manifests`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_manifest_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_manifest_hash: Option<String>,
    /// Output directories, relative to `root_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_relative_directories: Option<Vec<String>>,
}

/// All manifest records for a job plus its access mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachments {
    pub manifests: Vec<ManifestProperties>,
    #[serde(default)]
    pub file_system: FileSystemAccessMode,
}

impl Attachments {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachments_json_shape() {
        let attachments: Attachments = Attachments {
            manifests: vec![ManifestProperties {
                root_path: "/projects/job1".into(),
                root_path_format: PathFormat::Posix,
                file_system_location_name: Some("ProjectFiles".into()),
                input_manifest_path: Some("farm-1/queue-1/Inputs/abc/123_input".into()),
                input_manifest_hash: Some("abc123".into()),
                output_relative_directories: Some(vec!["renders".into()]),
            }],
            file_system: FileSystemAccessMode::Virtual,
        };

        let json: String = attachments.to_json().unwrap();
        assert!(json.contains(r#""rootPathFormat":"posix""#));
        assert!(json.contains(r#""outputRelativeDirectories":["renders"]"#));
        assert!(json.contains(r#""fileSystem":"VIRTUAL""#));

        let back: Attachments = serde_json::from_str(&json).unwrap();
        assert_eq!(back, attachments);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let props: ManifestProperties = ManifestProperties {
            root_path: "C:\\work".into(),
            root_path_format: PathFormat::Windows,
            file_system_location_name: None,
            input_manifest_path: None,
            input_manifest_hash: None,
            output_relative_directories: None,
        };
        let json: String = serde_json::to_string(&props).unwrap();
        assert!(!json.contains("inputManifestPath"));
        assert!(!json.contains("fileSystemLocationName"));
    }

    #[test]
    fn test_file_system_defaults_to_copied() {
        let parsed: Attachments = serde_json::from_str(r#"{"manifests":[]}"#).unwrap();
        assert_eq!(parsed.file_system, FileSystemAccessMode::Copied);
    }
}
