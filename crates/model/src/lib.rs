//! Asset manifest model for job attachments.
//!
//! A manifest lists the files under one asset root with their content
//! hash, size and modification time. Schema versions are resolved through
//! a small registry ([`manifest_model`]) so older manifests keep decoding
//! when a new version is introduced.
//!
//! The job-level records that reference manifests ([`Attachments`],
//! [`ManifestProperties`]) live here too, since every other crate shares them.

pub mod error;
pub mod hash;
pub mod job;
pub mod manifest;
pub mod merge;
pub mod version;

pub mod v2023_03_03;

mod canonical_json;
mod decode;

pub use canonical_json::{to_ascii_json, AsciiFormatter};
pub use decode::decode_manifest;
pub use error::ManifestError;
pub use hash::HashAlgorithm;
pub use job::{Attachments, FileSystemAccessMode, ManifestProperties, PathFormat};
pub use manifest::{AssetManifest, ManifestPath};
pub use merge::merge_manifests;
pub use version::{manifest_model, ManifestModel, ManifestVersion};
