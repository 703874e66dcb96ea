//! XXH128 hashing of byte buffers and files.

use std::io::Read;
use std::path::Path;

use xxhash_rust::xxh3::Xxh3;

use crate::constants::HASH_READ_BUFFER_SIZE;

/// Compute the XXH128 digest of a byte slice.
///
/// # Returns
/// 32-character lowercase hex string.
pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:032x}", xxhash_rust::xxh3::xxh3_128(data))
}

/// Hash a short identifier and keep the first `hex_len` hex characters.
///
/// Used for directory names derived from a root path, where a full
/// 128-bit digest is unnecessarily long.
///
/// # Arguments
/// * `data` - Identifier to hash
/// * `hex_len` - Number of hex characters to keep (capped at 32)
pub fn short_hash(data: &str, hex_len: usize) -> String {
    let mut digest: String = hash_bytes(data.as_bytes());
    digest.truncate(hex_len.min(32));
    digest
}

/// Compute the XXH128 digest of a file, reading it in fixed-size chunks.
///
/// # Errors
/// Returns the underlying IO error if the file cannot be opened or read.
pub fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    hash_file_with_progress(path, |_| true)
}

/// Compute the XXH128 digest of a file, reporting bytes as they are read.
///
/// The callback receives the size of each chunk read. Returning `false`
/// stops reading and yields an `Interrupted` IO error.
///
/// # Arguments
/// * `path` - File to hash
/// * `on_chunk` - Called after every chunk with the number of bytes read
pub fn hash_file_with_progress<F>(path: &Path, mut on_chunk: F) -> Result<String, std::io::Error>
where
    F: FnMut(u64) -> bool,
{
    let mut file: std::fs::File = std::fs::File::open(path)?;
    let mut hasher: Xxh3Hasher = Xxh3Hasher::new();
    let mut buffer: Vec<u8> = vec![0u8; HASH_READ_BUFFER_SIZE];

    loop {
        let bytes_read: usize = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        if !on_chunk(bytes_read as u64) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                format!("hashing of {} was cancelled", path.display()),
            ));
        }
    }

    Ok(hasher.finish_hex())
}

/// Streaming XXH128 hasher.
pub struct Xxh3Hasher {
    inner: Xxh3,
}

impl Xxh3Hasher {
    pub fn new() -> Self {
        Self { inner: Xxh3::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize and return the digest as a 32-char hex string.
    pub fn finish_hex(&self) -> String {
        format!("{:032x}", self.inner.digest128())
    }
}

impl Default for Xxh3Hasher {
    fn default() -> Self {
        Self::new()
    }
}
