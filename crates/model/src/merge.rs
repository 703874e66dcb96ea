//! Merging manifests that target the same asset root.
//!
//! Order matters: when a path appears in several manifests, the entry from
//! the manifest later in the list wins. Callers pass job inputs first and
//! step-dependency outputs after them, so outputs override inputs.

use crate::error::ManifestError;
use crate::manifest::{AssetManifest, ManifestPath};
use crate::version::manifest_model;

/// Merge manifests with last-wins semantics on path collisions.
///
/// # Returns
/// - `None` for an empty list
/// - a copy of the only manifest for a single-element list
/// - otherwise a new manifest holding the union of all paths
///
/// # Errors
/// `MergeHashAlgorithmMismatch` if the manifests use different hash algorithms.
pub fn merge_manifests(manifests: &[AssetManifest]) -> Result<Option<AssetManifest>, ManifestError> {
    let (first, rest) = match manifests.split_first() {
        None => return Ok(None),
        Some(split) => split,
    };
    if rest.is_empty() {
        return Ok(Some(first.clone()));
    }

    let hash_alg = first.hash_alg;
    if let Some(mismatch) = rest.iter().find(|m| m.hash_alg != hash_alg) {
        return Err(ManifestError::MergeHashAlgorithmMismatch {
            expected: hash_alg,
            actual: mismatch.hash_alg,
        });
    }

    // Construction deduplicates with last-wins, so concatenating in order is enough.
    let combined: Vec<ManifestPath> = manifests
        .iter()
        .flat_map(|m| m.paths().iter().cloned())
        .collect();

    let model = manifest_model(first.manifest_version)?;
    Ok(Some((model.new_manifest)(hash_alg, combined)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_empty_is_none() {
        assert!(merge_manifests(&[]).unwrap().is_none());
    }

    #[test]
    fn test_merge_single_is_unchanged() {
        let a: AssetManifest = AssetManifest::new(vec![ManifestPath::new("p", "aaa", 1, 1)]);
        assert_eq!(merge_manifests(&[a.clone()]).unwrap(), Some(a));
    }

    #[test]
    fn test_merge_last_wins() {
        let a: AssetManifest = AssetManifest::new(vec![
            ManifestPath::new("p", "aaa", 1, 1),
            ManifestPath::new("only_a", "a2", 10, 1),
        ]);
        let b: AssetManifest = AssetManifest::new(vec![
            ManifestPath::new("p", "bbb", 4, 2),
            ManifestPath::new("only_b", "b2", 100, 2),
        ]);

        let merged: AssetManifest = merge_manifests(&[a, b]).unwrap().unwrap();
        let p: &ManifestPath = merged.paths().iter().find(|e| e.path == "p").unwrap();
        assert_eq!(p.hash, "bbb");
        assert_eq!(merged.file_count(), 3);
        assert_eq!(merged.total_size(), 114);
    }
}
