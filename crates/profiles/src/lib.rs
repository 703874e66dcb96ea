//! Storage profiles and path grouping for job attachments.
//!
//! - **Storage Profiles** - named LOCAL and SHARED file system locations
//! - **Path Grouping** - one [`AssetRootGroup`] per asset root, respecting those locations
//! - **Path Mapping** - rules that relocate a submitted root on the executing host
//!
//! # Location Types
//!
//! - `LOCAL` - files are uploaded with the job
//! - `SHARED` - files are reachable by workers already and are skipped

mod grouping;
mod types;

pub use grouping::{
    group_asset_paths, AssetRootGroup, AssetRootManifest, AssetUploadGroup, PathGroupingError,
};
pub use types::{
    FileSystemLocation, FileSystemLocationType, PathMappingRule, StorageProfile,
    StorageProfileOsFamily,
};
