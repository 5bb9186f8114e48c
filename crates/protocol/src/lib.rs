pub mod constants;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::{CHUNK_DIGEST_HEADER, chunk_path, finalize_path};
pub use messages::{FinalizeRequest, FinalizeResponse};
pub use types::{ChunkStatus, GlobalProgress, JobState, ProgressSnapshot, SessionRecord};
