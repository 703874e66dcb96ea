//! Manifest schema versions and the model registry.
//!
//! Each supported version registers a [`ManifestModel`]: how to construct its
//! paths and manifests, its default hash algorithm, and its codec. Versions
//! that are recognized but not registered fail with
//! [`ManifestError::UnsupportedManifestVersion`].

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;
use crate::hash::HashAlgorithm;
use crate::manifest::{AssetManifest, ManifestPath};
use crate::v2023_03_03;

/// Known manifest format versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum ManifestVersion {
    #[serde(rename = "2022-03-01")]
    V2022_03_01,
    #[serde(rename = "2022-06-06")]
    V2022_06_06,
    #[serde(rename = "2023-03-03")]
    V2023_03_03,
}

/// Version used for newly created manifests.
pub const DEFAULT_MANIFEST_VERSION: ManifestVersion = ManifestVersion::V2023_03_03;

impl ManifestVersion {
    pub const ALL: [ManifestVersion; 3] = [
        ManifestVersion::V2022_03_01,
        ManifestVersion::V2022_06_06,
        ManifestVersion::V2023_03_03,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestVersion::V2022_03_01 => "2022-03-01",
            ManifestVersion::V2022_06_06 => "2022-06-06",
            ManifestVersion::V2023_03_03 => "2023-03-03",
        }
    }

    /// MIME type used when a manifest of this version is stored as an object.
    pub fn content_type(&self) -> String {
        format!("application/x-deadline-manifest-{}", self.as_str())
    }
}

impl FromStr for ManifestVersion {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ManifestVersion::ALL
            .iter()
            .copied()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| ManifestError::UnknownManifestVersion {
                found: s.to_string(),
                supported: ManifestVersion::ALL
                    .iter()
                    .map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

impl std::fmt::Display for ManifestVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Constructors and codec for one manifest version.
pub struct ManifestModel {
    pub manifest_version: ManifestVersion,
    pub default_hash_alg: HashAlgorithm,
    pub new_path: fn(path: String, hash: String, size: u64, mtime: i64) -> ManifestPath,
    pub new_manifest: fn(hash_alg: HashAlgorithm, paths: Vec<ManifestPath>) -> AssetManifest,
    pub encode: fn(&AssetManifest) -> Result<String, ManifestError>,
    pub decode: fn(&serde_json::Value) -> Result<AssetManifest, ManifestError>,
}

impl std::fmt::Debug for ManifestModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestModel")
            .field("manifest_version", &self.manifest_version)
            .field("default_hash_alg", &self.default_hash_alg)
            .finish()
    }
}

static REGISTRY: &[ManifestModel] = &[v2023_03_03::MODEL];

/// Look up the registered model for a version.
///
/// # Errors
/// `UnsupportedManifestVersion` if the version has no registered model.
pub fn manifest_model(version: ManifestVersion) -> Result<&'static ManifestModel, ManifestError> {
    REGISTRY
        .iter()
        .find(|m| m.manifest_version == version)
        .ok_or(ManifestError::UnsupportedManifestVersion(version))
}
