//! Hash algorithm definitions.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// Hash algorithms a manifest may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "xxh128")]
    Xxh128,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Xxh128 => "xxh128",
        }
    }

    /// Hash an in-memory buffer.
    pub fn hash_data(&self, data: &[u8]) -> String {
        match self {
            HashAlgorithm::Xxh128 => ja_common::hash_bytes(data),
        }
    }

    /// Hash a file in fixed-size chunks.
    pub fn hash_file(&self, path: &Path) -> Result<String, std::io::Error> {
        match self {
            HashAlgorithm::Xxh128 => ja_common::hash_file(path),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xxh128" => Ok(HashAlgorithm::Xxh128),
            other => Err(ManifestError::UnsupportedHashAlgorithm(other.to_string())),
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
