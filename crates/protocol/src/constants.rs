use std::time::Duration;

/// Header carrying the hex SHA-256 of a chunk body.
pub const CHUNK_DIGEST_HEADER: &str = "X-Chunk-Digest";

/// Timeout for a single chunk transfer attempt.
///
/// Expiry is a retryable failure, not a fatal one.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for the finalize call. The server assembles and re-hashes the
/// whole file before answering, so this is longer than a chunk attempt.
pub const FINALIZE_TIMEOUT: Duration = Duration::from_secs(300);

/// Length of a session key in hex characters.
pub const SESSION_KEY_LEN: usize = 32;

/// Relative endpoint for uploading chunk `index` of a session.
pub fn chunk_path(session_key: &str, index: u32) -> String {
    format!("uploads/{session_key}/chunks/{index}")
}

/// Relative endpoint for finalizing a session.
pub fn finalize_path(session_key: &str) -> String {
    format!("uploads/{session_key}/finalize")
}
