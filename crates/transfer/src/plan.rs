use serde::{Deserialize, Serialize};

use crate::{MAX_CHUNK_SIZE, MAX_CHUNKS, MIN_CHUNK_SIZE, TransferError};

/// Size policy used to choose a chunk size from a file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkPolicy {
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    /// Soft ceiling on chunk count. Exceeded only when even
    /// `max_chunk_size` cannot satisfy it.
    pub max_chunks: u64,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            min_chunk_size: MIN_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            max_chunks: MAX_CHUNKS,
        }
    }
}

impl ChunkPolicy {
    /// A policy that always uses exactly `chunk_size`.
    pub fn fixed(chunk_size: u64) -> Self {
        Self {
            min_chunk_size: chunk_size,
            max_chunk_size: chunk_size,
            max_chunks: MAX_CHUNKS,
        }
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.min_chunk_size == 0 {
            return Err(TransferError::InvalidPolicy(
                "minimum chunk size must be positive".into(),
            ));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(TransferError::InvalidPolicy(format!(
                "minimum chunk size {} exceeds maximum {}",
                self.min_chunk_size, self.max_chunk_size
            )));
        }
        if self.max_chunks == 0 {
            return Err(TransferError::InvalidPolicy(
                "chunk count ceiling must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Chooses the chunk size for a file of `file_size` bytes.
    ///
    /// Smallest power of two that keeps the chunk count under the ceiling,
    /// clamped to `[min_chunk_size, max_chunk_size]`.
    pub fn chunk_size_for(&self, file_size: u64) -> u64 {
        if self.min_chunk_size == self.max_chunk_size {
            return self.min_chunk_size;
        }
        let needed = file_size
            .div_ceil(self.max_chunks)
            .max(self.min_chunk_size);
        needed
            .checked_next_power_of_two()
            .unwrap_or(self.max_chunk_size)
            .clamp(self.min_chunk_size, self.max_chunk_size)
    }
}

/// Byte range of one planned chunk, before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u32,
    pub offset: u64,
    pub length: u64,
}

impl ChunkSpan {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// A planned, hashed chunk. Immutable once produced by the hasher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub offset: u64,
    pub length: u64,
    /// SHA-256 hex of the chunk bytes.
    pub digest: String,
}

impl ChunkDescriptor {
    pub fn span(&self) -> ChunkSpan {
        ChunkSpan {
            index: self.index,
            offset: self.offset,
            length: self.length,
        }
    }
}

/// Ordered, gapless partition of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub chunk_size: u64,
    pub spans: Vec<ChunkSpan>,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Partitions a file of `file_size` bytes according to `policy`.
///
/// Deterministic in `(file_size, policy)`. An empty file still yields one
/// zero-length chunk so the remote side sees the session.
pub fn plan_chunks(file_size: u64, policy: &ChunkPolicy) -> Result<ChunkPlan, TransferError> {
    policy.validate()?;

    let chunk_size = policy.chunk_size_for(file_size);
    let count = file_size.div_ceil(chunk_size).max(1);
    if count > u64::from(u32::MAX) {
        return Err(TransferError::TooManyChunks(count));
    }

    let mut spans = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    for index in 0..count as u32 {
        let length = chunk_size.min(file_size - offset);
        spans.push(ChunkSpan {
            index,
            offset,
            length,
        });
        offset += length;
    }

    Ok(ChunkPlan {
        file_size,
        chunk_size,
        spans,
    })
}
