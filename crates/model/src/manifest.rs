//! Version-independent manifest types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::decode::decode_manifest;
use crate::error::ManifestError;
use crate::hash::HashAlgorithm;
use crate::version::{manifest_model, ManifestVersion, DEFAULT_MANIFEST_VERSION};

/// One file entry in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestPath {
    /// POSIX-style path relative to the asset root.
    pub path: String,
    /// Content hash as lowercase hex.
    pub hash: String,
    /// Size in bytes.
    pub size: u64,
    /// Modification time in microseconds since the epoch.
    pub mtime: i64,
}

impl ManifestPath {
    pub fn new(path: impl Into<String>, hash: impl Into<String>, size: u64, mtime: i64) -> Self {
        Self {
            path: path.into(),
            hash: hash.into(),
            size,
            mtime,
        }
    }
}

/// The set of files under one asset root.
///
/// Paths are unique; when built from a list containing the same path more
/// than once, the last entry wins. `total_size` always equals the sum of
/// path sizes.
#[derive(Debug, Clone)]
pub struct AssetManifest {
    pub hash_alg: HashAlgorithm,
    pub manifest_version: ManifestVersion,
    paths: Vec<ManifestPath>,
    total_size: u64,
}

impl AssetManifest {
    /// Build a manifest of the default version with its default hash algorithm.
    pub fn new(paths: Vec<ManifestPath>) -> Self {
        Self::with_version(DEFAULT_MANIFEST_VERSION, HashAlgorithm::Xxh128, paths)
    }

    /// Build a manifest with an explicit version and hash algorithm.
    pub fn with_version(
        manifest_version: ManifestVersion,
        hash_alg: HashAlgorithm,
        paths: Vec<ManifestPath>,
    ) -> Self {
        let paths: Vec<ManifestPath> = dedup_last_wins(paths);
        let total_size: u64 = paths.iter().map(|p| p.size).sum();
        Self {
            hash_alg,
            manifest_version,
            paths,
            total_size,
        }
    }

    pub fn paths(&self) -> &[ManifestPath] {
        &self.paths
    }

    pub fn into_paths(self) -> Vec<ManifestPath> {
        self.paths
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn file_count(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Default hash algorithm registered for `version`.
    pub fn get_default_hash_alg(version: ManifestVersion) -> Result<HashAlgorithm, ManifestError> {
        Ok(manifest_model(version)?.default_hash_alg)
    }

    /// Canonical encoding for this manifest's version.
    pub fn encode(&self) -> Result<String, ManifestError> {
        (manifest_model(self.manifest_version)?.encode)(self)
    }

    /// Decode and validate a manifest document of any registered version.
    pub fn decode(document: &str) -> Result<Self, ManifestError> {
        decode_manifest(document)
    }

    /// Rewrite every path through `f`, keeping uniqueness.
    pub fn map_paths<F>(self, mut f: F) -> Self
    where
        F: FnMut(&str) -> String,
    {
        let paths: Vec<ManifestPath> = self
            .paths
            .into_iter()
            .map(|mut p| {
                p.path = f(&p.path);
                p
            })
            .collect();
        Self::with_version(self.manifest_version, self.hash_alg, paths)
    }
}

/// Equality ignores path order; two manifests describing the same files are equal.
impl PartialEq for AssetManifest {
    fn eq(&self, other: &Self) -> bool {
        if self.hash_alg != other.hash_alg
            || self.manifest_version != other.manifest_version
            || self.total_size != other.total_size
            || self.paths.len() != other.paths.len()
        {
            return false;
        }
        let mut ours: Vec<&ManifestPath> = self.paths.iter().collect();
        let mut theirs: Vec<&ManifestPath> = other.paths.iter().collect();
        ours.sort_by(|a, b| a.path.cmp(&b.path));
        theirs.sort_by(|a, b| a.path.cmp(&b.path));
        ours == theirs
    }
}

impl Eq for AssetManifest {}

fn dedup_last_wins(paths: Vec<ManifestPath>) -> Vec<ManifestPath> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(paths.len());
    let mut unique: Vec<ManifestPath> = Vec::with_capacity(paths.len());

    for entry in paths {
        match index.get(&entry.path) {
            Some(&slot) => unique[slot] = entry,
            None => {
                index.insert(entry.path.clone(), unique.len());
                unique.push(entry);
            }
        }
    }

    unique
}
