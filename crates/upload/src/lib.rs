//! Resumable, chunked upload pipeline with queue management.
//!
//! This crate turns validated files into queued, retried, resumable chunk
//! transfers. It owns no network code beyond the [`ChunkTransport`] seam;
//! [`HttpTransport`] is the stock implementation.
//!
//! # Pipeline
//!
//! 1. **Validate**: size, type allow-list and content sniff
//! 2. **Plan + hash**: deterministic chunk plan, whole-file and per-chunk digests
//! 3. **Queue**: priority order, FIFO between equal priorities
//! 4. **Transfer**: a fixed worker pool bounded globally across jobs
//! 5. **Retry**: exponential backoff with jitter, capped attempts
//! 6. **Resume**: acked chunk indices persisted per file
//! 7. **Finalize**: once every chunk is acked

pub mod error;
pub mod events;
pub mod http;
pub mod job;
pub mod manager;
mod pool;
mod queue;
pub mod retry;
mod scheduler;
pub mod transport;

// Re-export primary types for convenience.
pub use error::UploadError;
pub use events::JobEvent;
pub use http::HttpTransport;
pub use job::{ChunkTransferRecord, FileDescriptor, JobId, JobSummary};
pub use manager::{UploadConfig, UploadManager};
pub use retry::{FailureKind, RetryDecision, RetryPolicy};
pub use transport::{ChunkPayload, ChunkTransport, ProgressFn, TransportError};
