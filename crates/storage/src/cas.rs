//! Multipart part planning for CAS uploads.
//!
//! Pure logic, no I/O: how a file of a given size is cut into parts.

use ja_common::{S3_MAX_PARTS, S3_MIN_PART_SIZE};

/// Largest part size the object store accepts (5 GiB).
pub const S3_MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// One part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    /// 1-based part number.
    pub part_number: i32,
    /// Byte offset within the file.
    pub offset: u64,
    /// Length of this part in bytes.
    pub length: u64,
}

/// Whether a file of `size` bytes should use a multipart upload.
pub fn needs_multipart(size: u64, chunk_size: u64) -> bool {
    chunk_size > 0 && size > chunk_size
}

/// Clamp a requested part size into the store's limits for a file of `file_size`.
///
/// The size is first clamped to [5 MiB, 5 GiB], then doubled until the
/// part count fits within 10,000 parts.
pub fn adjust_chunk_size(file_size: u64, requested: u64) -> u64 {
    let mut chunk_size: u64 = requested.clamp(S3_MIN_PART_SIZE, S3_MAX_PART_SIZE);
    while chunk_size < S3_MAX_PART_SIZE && file_size.div_ceil(chunk_size) > S3_MAX_PARTS {
        chunk_size = (chunk_size * 2).min(S3_MAX_PART_SIZE);
    }
    chunk_size
}

/// Cut a file of `size` bytes into parts of `chunk_size` bytes.
///
/// The last part may be shorter. An empty file yields one empty part.
pub fn generate_parts(size: u64, chunk_size: u64) -> Vec<PartInfo> {
    if chunk_size == 0 || size == 0 {
        return vec![PartInfo {
            part_number: 1,
            offset: 0,
            length: size,
        }];
    }

    let mut parts: Vec<PartInfo> = Vec::new();
    let mut offset: u64 = 0;
    let mut part_number: i32 = 1;

    while offset < size {
        let length: u64 = std::cmp::min(chunk_size, size - offset);
        parts.push(PartInfo {
            part_number,
            offset,
            length,
        });
        offset += length;
        part_number += 1;
    }

    parts
}

/// [`adjust_chunk_size`] followed by [`generate_parts`].
pub fn plan_multipart(size: u64, requested_chunk_size: u64) -> Vec<PartInfo> {
    generate_parts(size, adjust_chunk_size(size, requested_chunk_size))
}
