//! Chunk transport trait.
//!
//! `ChunkTransport` is the seam between the scheduler and the remote side.
//! The HTTP implementation lives in [`crate::http`]; tests plug in mocks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use paperdrop_protocol::{FinalizeRequest, FinalizeResponse};
use tokio_util::sync::CancellationToken;

use crate::retry::FailureKind;

/// Callback receiving the cumulative number of bytes sent in the current
/// attempt. Called between byte ranges.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Errors reported by a transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("server responded {status}: {message}")]
    Status { status: u16, message: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Maps the error onto the retry taxonomy.
    ///
    /// 409/422 signal a digest mismatch; 429 and 5xx are retryable; every
    /// other status is fatal.
    pub fn classify(&self) -> FailureKind {
        match self {
            Self::Timeout | Self::Connection(_) => FailureKind::Transient,
            Self::Status { status, .. } => match status {
                409 | 422 => FailureKind::Integrity,
                429 | 500..=599 => FailureKind::Transient,
                _ => FailureKind::Fatal,
            },
            Self::InvalidResponse(_) | Self::Cancelled => FailureKind::Fatal,
        }
    }
}

/// One chunk attempt handed to a transport.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub session_key: String,
    pub index: u32,
    /// SHA-256 hex sent alongside the bytes for server-side verification.
    pub digest: String,
    pub data: Bytes,
}

/// Abstract connection to the upload endpoint.
///
/// Implementations must stop promptly once `cancel` fires and must report
/// success only when the remote side acknowledged the whole chunk.
pub trait ChunkTransport: Send + Sync {
    /// Sends one chunk and waits for the acknowledgement.
    fn put_chunk(
        &self,
        chunk: ChunkPayload,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Asks the remote side to assemble the acknowledged chunks.
    fn finalize(
        &self,
        session_key: String,
        request: FinalizeRequest,
    ) -> Pin<Box<dyn Future<Output = Result<FinalizeResponse, TransportError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(TransportError::status(409, "").classify(), FailureKind::Integrity);
        assert_eq!(TransportError::status(422, "").classify(), FailureKind::Integrity);
        assert_eq!(TransportError::status(429, "").classify(), FailureKind::Transient);
        assert_eq!(TransportError::status(500, "").classify(), FailureKind::Transient);
        assert_eq!(TransportError::status(503, "").classify(), FailureKind::Transient);
        assert_eq!(TransportError::status(400, "").classify(), FailureKind::Fatal);
        assert_eq!(TransportError::status(403, "").classify(), FailureKind::Fatal);
        assert_eq!(TransportError::status(404, "").classify(), FailureKind::Fatal);
    }

    #[test]
    fn network_failures_are_transient() {
        assert_eq!(TransportError::Timeout.classify(), FailureKind::Transient);
        assert_eq!(
            TransportError::Connection("reset by peer".into()).classify(),
            FailureKind::Transient
        );
        assert_eq!(
            TransportError::InvalidResponse("garbage".into()).classify(),
            FailureKind::Fatal
        );
    }

    #[test]
    fn status_display() {
        let e = TransportError::status(503, "unavailable");
        assert_eq!(e.to_string(), "server responded 503: unavailable");
    }
}
