//! Version-dispatching manifest decoder.

use serde_json::Value;

use crate::error::ManifestError;
use crate::manifest::AssetManifest;
use crate::version::{manifest_model, ManifestVersion};

/// Parse a manifest document, detect its version, and validate it with
/// that version's registered model.
///
/// # Errors
/// Any [`ManifestError`] other than a merge mismatch.
pub fn decode_manifest(document: &str) -> Result<AssetManifest, ManifestError> {
    let value: Value = serde_json::from_str(document)?;

    let version: ManifestVersion = value
        .get("manifestVersion")
        .ok_or(ManifestError::MissingManifestVersion)?
        .as_str()
        .ok_or_else(|| ManifestError::Validation("\"manifestVersion\" must be a string".into()))?
        .parse()?;

    (manifest_model(version)?.decode)(&value)
}
