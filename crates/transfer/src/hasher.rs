use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use paperdrop_protocol::constants::SESSION_KEY_LEN;
use sha2::{Digest, Sha256};

use crate::plan::{ChunkDescriptor, ChunkPlan, ChunkSpan};
use crate::{HASH_BUFFER_SIZE, TransferError};

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Checks `data` against the digest declared for chunk `index`.
pub fn verify_chunk(index: u32, data: &[u8], expected: &str) -> Result<(), TransferError> {
    if checksum_bytes(data) == expected {
        Ok(())
    } else {
        Err(TransferError::ChecksumMismatch { index })
    }
}

/// Derives the stable session key for a file from its digest and size.
///
/// The same logical file re-selected by the user maps to the same key.
pub fn session_key(digest: &str, size: u64) -> String {
    let mut key = checksum_bytes(format!("{digest}:{size}").as_bytes());
    key.truncate(SESSION_KEY_LEN);
    key
}

// ---------------------------------------------------------------------------
// Whole-file + per-chunk hashing
// ---------------------------------------------------------------------------

/// Digests produced by one streaming pass over a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigests {
    /// SHA-256 hex of the whole file.
    pub digest: String,
    pub chunks: Vec<ChunkDescriptor>,
}

/// Hashes `path` once, producing the whole-file digest and one digest per
/// planned chunk.
///
/// Fails with [`TransferError::SizeChanged`] if the file no longer matches
/// the size the plan was built for.
pub fn hash_file(path: &Path, plan: &ChunkPlan) -> Result<FileDigests, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let actual = file.metadata()?.len();
    if actual != plan.file_size {
        return Err(TransferError::SizeChanged {
            expected: plan.file_size,
            actual,
        });
    }

    let mut whole = Sha256::new();
    let mut chunks = Vec::with_capacity(plan.len());
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];

    for span in &plan.spans {
        let mut per_chunk = Sha256::new();
        let mut remaining = span.length;
        while remaining > 0 {
            let to_read = (remaining as usize).min(buf.len());
            file.read_exact(&mut buf[..to_read])?;
            whole.update(&buf[..to_read]);
            per_chunk.update(&buf[..to_read]);
            remaining -= to_read as u64;
        }
        chunks.push(ChunkDescriptor {
            index: span.index,
            offset: span.offset,
            length: span.length,
            digest: hex::encode(per_chunk.finalize()),
        });
    }

    Ok(FileDigests {
        digest: hex::encode(whole.finalize()),
        chunks,
    })
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads planned chunk spans from a file by offset.
pub struct ChunkReader {
    file: std::fs::File,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for span reads.
    pub fn new(path: &Path) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        Ok(Self { file, file_size })
    }

    /// Reads exactly the bytes of `span`.
    ///
    /// A file truncated since planning yields an `UnexpectedEof` I/O error.
    pub fn read_span(&mut self, span: &ChunkSpan) -> Result<Vec<u8>, TransferError> {
        self.file.seek(SeekFrom::Start(span.offset))?;
        let mut buf = vec![0u8; span.length as usize];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Total file size in bytes at open time.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}
