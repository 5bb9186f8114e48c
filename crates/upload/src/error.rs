//! Upload error types.

use paperdrop_transfer::{Rejection, SessionError, TransferError};

use crate::job::JobId;
use crate::retry::FailureKind;
use crate::transport::TransportError;

/// Errors produced by the upload pipeline.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Rejected before any network activity. Never retried.
    #[error("validation failed: {0}")]
    Validation(#[from] Rejection),

    #[error("transient transport error: {0}")]
    TransientTransport(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("fatal transport error: {0}")]
    FatalTransport(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session store error: {0}")]
    Session(#[from] SessionError),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {job} is {state}, cannot {action}")]
    InvalidState {
        job: JobId,
        state: paperdrop_protocol::JobState,
        action: &'static str,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("upload manager has shut down")]
    Shutdown,
}

impl UploadError {
    /// How the retry controller should treat this error, if it came from a
    /// chunk attempt. `None` for errors that are not attempt outcomes.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::TransientTransport(_) => Some(FailureKind::Transient),
            Self::Integrity(_) => Some(FailureKind::Integrity),
            Self::FatalTransport(_) | Self::Io(_) | Self::Transfer(_) => Some(FailureKind::Fatal),
            _ => None,
        }
    }
}

impl From<TransferError> for UploadError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Io(e) => Self::Io(e),
            TransferError::Rejected(r) => Self::Validation(r),
            TransferError::ChecksumMismatch { index } => {
                Self::Integrity(format!("chunk {index} does not match its digest"))
            }
            other => Self::Transfer(other.to_string()),
        }
    }
}

impl From<TransportError> for UploadError {
    fn from(e: TransportError) -> Self {
        if matches!(e, TransportError::Cancelled) {
            return Self::Cancelled;
        }
        match e.classify() {
            FailureKind::Transient => Self::TransientTransport(e.to_string()),
            FailureKind::Integrity => Self::Integrity(e.to_string()),
            FailureKind::Fatal => Self::FatalTransport(e.to_string()),
        }
    }
}
