//! Error types for manifest operations.

use thiserror::Error;

use crate::hash::HashAlgorithm;
use crate::version::ManifestVersion;

/// Errors raised while building, encoding, decoding or merging manifests.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest is not valid JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Manifest is missing the required \"manifestVersion\" field")]
    MissingManifestVersion,

    #[error("Unknown manifest version: {found} (Currently supported Manifest versions: {supported})")]
    UnknownManifestVersion { found: String, supported: String },

    #[error("No model for asset manifest version: {0}")]
    UnsupportedManifestVersion(ManifestVersion),

    #[error("Unsupported hashing algorithm provided: {0}")]
    UnsupportedHashAlgorithm(String),

    /// Structural problem found while decoding.
    #[error("Manifest failed validation: {0}")]
    Validation(String),

    #[error("The hash {hash} for path {path} is not alphanumeric")]
    NonAlphanumericHash { path: String, hash: String },

    #[error("Manifest contains duplicate path: {path}")]
    DuplicatePath { path: String },

    #[error("Manifest path {path} is not a normalized relative path")]
    InvalidPath { path: String },

    #[error("Cannot merge manifests with different hash algorithms: expected {expected}, got {actual}")]
    MergeHashAlgorithmMismatch {
        expected: HashAlgorithm,
        actual: HashAlgorithm,
    },
}

impl ManifestError {
    /// Whether this error came from reading a manifest document.
    pub fn is_decode_error(&self) -> bool {
        !matches!(self, ManifestError::MergeHashAlgorithmMismatch { .. })
    }
}
