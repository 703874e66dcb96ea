//! Local file system work for job attachments.
//!
//! - [`ManifestBuilder`] - hashes input files into manifests, backed by the hash cache
//! - [`find_output_files`] - selects new or modified files under output directories

pub mod error;
pub mod hashing;
pub mod outputs;

pub use error::FileSystemError;
pub use hashing::{modified_time_us, ManifestBuilder};
pub use outputs::{convert_path_separators, find_output_files, OutputFile, OutputScanOptions};
