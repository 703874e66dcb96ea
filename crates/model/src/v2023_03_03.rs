//! Version 2023-03-03 of the manifest format.
//!
//! Document shape (keys shown in canonical order):
//!
//! ```text
//! {"hashAlg":"xxh128","manifestVersion":"2023-03-03",
//!  "paths":[{"hash":"..","mtime":1234,"path":"a/b.txt","size":10}, ...],
//!  "totalSize":10}
//! ```
//!
//! In the canonical encoding `paths` is sorted by path in descending
//! UTF-16 code unit order.

use std::collections::HashSet;
use std::path::{Component, Path};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::canonical_json::{to_ascii_json, utf16_cmp};
use crate::error::ManifestError;
use crate::hash::HashAlgorithm;
use crate::manifest::{AssetManifest, ManifestPath};
use crate::version::{ManifestModel, ManifestVersion};

/// Registry entry for this version.
pub const MODEL: ManifestModel = ManifestModel {
    manifest_version: ManifestVersion::V2023_03_03,
    default_hash_alg: HashAlgorithm::Xxh128,
    new_path,
    new_manifest,
    encode,
    decode,
};

fn new_path(path: String, hash: String, size: u64, mtime: i64) -> ManifestPath {
    ManifestPath {
        path,
        hash,
        size,
        mtime,
    }
}

fn new_manifest(hash_alg: HashAlgorithm, paths: Vec<ManifestPath>) -> AssetManifest {
    AssetManifest::with_version(ManifestVersion::V2023_03_03, hash_alg, paths)
}

/// Canonical JSON for a manifest of this version.
pub fn encode(manifest: &AssetManifest) -> Result<String, ManifestError> {
    let mut paths: Vec<CanonicalPath<'_>> = manifest
        .paths()
        .iter()
        .map(|entry| CanonicalPath {
            hash: &entry.hash,
            mtime: entry.mtime,
            path: &entry.path,
            size: entry.size,
        })
        .collect();
    paths.sort_by(|a, b| utf16_cmp(b.path, a.path));

    let document: CanonicalManifest<'_> = CanonicalManifest {
        hash_alg: manifest.hash_alg.as_str(),
        manifest_version: ManifestVersion::V2023_03_03.as_str(),
        paths,
        total_size: manifest.total_size(),
    };
    Ok(to_ascii_json(&document)?)
}

// Field declaration order is the canonical key order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalManifest<'m> {
    hash_alg: &'m str,
    manifest_version: &'m str,
    paths: Vec<CanonicalPath<'m>>,
    total_size: u64,
}

#[derive(Serialize)]
struct CanonicalPath<'m> {
    hash: &'m str,
    mtime: i64,
    path: &'m str,
    size: u64,
}

/// Validate and decode a parsed document of this version.
///
/// # Errors
/// - `Validation` for missing or mistyped fields
/// - `UnsupportedHashAlgorithm` for an unknown `hashAlg`
/// - `InvalidPath` for absolute paths or paths with `.`/`..` segments
/// - `DuplicatePath` if a path appears twice
/// - `NonAlphanumericHash` for hashes outside `[a-zA-Z0-9]+`
pub fn decode(document: &Value) -> Result<AssetManifest, ManifestError> {
    let object: &Map<String, Value> = document
        .as_object()
        .ok_or_else(|| ManifestError::Validation("manifest must be a JSON object".into()))?;

    let hash_alg: HashAlgorithm = required_str(object, "hashAlg", "manifest")?.parse()?;
    let declared_total: u64 = required_u64(object, "totalSize", "manifest")?;
    let raw_paths: &Vec<Value> = object
        .get("paths")
        .and_then(Value::as_array)
        .ok_or_else(|| ManifestError::Validation("\"paths\" must be an array".into()))?;

    let mut seen: HashSet<&str> = HashSet::with_capacity(raw_paths.len());
    let mut paths: Vec<ManifestPath> = Vec::with_capacity(raw_paths.len());

    for raw in raw_paths {
        let entry: &Map<String, Value> = raw
            .as_object()
            .ok_or_else(|| ManifestError::Validation("path entries must be objects".into()))?;

        let path: &str = required_str(entry, "path", "path entry")?;
        let hash: &str = required_str(entry, "hash", path)?;
        let size: u64 = required_u64(entry, "size", path)?;
        let mtime: i64 = entry
            .get("mtime")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                ManifestError::Validation(format!("\"mtime\" of {} must be an integer", path))
            })?;

        validate_relative_path(path)?;
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ManifestError::NonAlphanumericHash {
                path: path.to_string(),
                hash: hash.to_string(),
            });
        }
        if !seen.insert(path) {
            return Err(ManifestError::DuplicatePath {
                path: path.to_string(),
            });
        }

        paths.push(new_path(path.to_string(), hash.to_string(), size, mtime));
    }

    let manifest: AssetManifest = new_manifest(hash_alg, paths);
    if manifest.total_size() != declared_total {
        return Err(ManifestError::Validation(format!(
            "\"totalSize\" is {} but paths sum to {}",
            declared_total,
            manifest.total_size()
        )));
    }

    Ok(manifest)
}

fn required_str<'a>(
    object: &'a Map<String, Value>,
    key: &str,
    owner: &str,
) -> Result<&'a str, ManifestError> {
    object
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ManifestError::Validation(format!("\"{}\" of {} must be a string", key, owner)))
}

fn required_u64(
    object: &Map<String, Value>,
    key: &str,
    owner: &str,
) -> Result<u64, ManifestError> {
    object.get(key).and_then(Value::as_u64).ok_or_else(|| {
        ManifestError::Validation(format!(
            "\"{}\" of {} must be a non-negative integer",
            key, owner
        ))
    })
}

fn validate_relative_path(path: &str) -> Result<(), ManifestError> {
    let invalid = || ManifestError::InvalidPath {
        path: path.to_string(),
    };
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return Err(invalid());
    }
    for component in Path::new(path).components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(invalid());
        }
    }
    Ok(())
}
