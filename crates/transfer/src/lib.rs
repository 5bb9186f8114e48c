//! Leaf components of the upload pipeline.
//!
//! Everything here runs before or beside the network: validating a candidate
//! file, planning its chunks, hashing it, persisting which chunks the remote
//! side has acknowledged, and turning per-chunk byte counts into progress.

mod hasher;
mod plan;
mod progress;
mod session;
mod validation;

pub use hasher::{
    ChunkReader, FileDigests, calculate_file_checksum, checksum_bytes, hash_file, session_key,
    verify_chunk,
};
pub use plan::{ChunkDescriptor, ChunkPlan, ChunkPolicy, ChunkSpan, plan_chunks};
pub use progress::{SpeedCalculator, aggregate, aggregate_global};
pub use session::{FileSessionStore, MemorySessionStore, SessionError, SessionStore};
pub use validation::{AllowedType, ContentCategory, Rejection, ValidatedFile, Validator, ValidatorConfig, sniff};

/// Lower bound for automatically chosen chunk sizes: 256 KiB.
pub const MIN_CHUNK_SIZE: u64 = 256 * 1024;

/// Upper bound for automatically chosen chunk sizes: 10 MiB.
pub const MAX_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Target ceiling on the number of chunks per file.
pub const MAX_CHUNKS: u64 = 10_000;

/// Read buffer used while streaming a file through the hasher.
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("checksum mismatch for chunk {index}")]
    ChecksumMismatch { index: u32 },

    #[error("invalid chunk policy: {0}")]
    InvalidPolicy(String),

    #[error("file needs {0} chunks, more than a plan can index")]
    TooManyChunks(u64),

    #[error("file size changed: planned {expected} bytes, found {actual}")]
    SizeChanged { expected: u64, actual: u64 },
}
