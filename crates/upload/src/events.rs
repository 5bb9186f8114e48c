use paperdrop_protocol::JobState;
use serde::Serialize;

use crate::job::JobId;

/// Notification published by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum JobEvent {
    /// Job moved between lifecycle states.
    StateChanged {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
    /// The remote side acknowledged a chunk.
    ChunkAcked { job_id: JobId, index: u32 },
    /// A chunk attempt failed.
    ChunkFailed {
        job_id: JobId,
        index: u32,
        attempts: u32,
        error: String,
        will_retry: bool,
    },
    /// The remote side assembled the file.
    Finalized {
        job_id: JobId,
        file_id: String,
        location: String,
    },
    /// A recoverable problem the job continues through.
    Error { job_id: JobId, message: String },
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::StateChanged { job_id, .. }
            | JobEvent::ChunkAcked { job_id, .. }
            | JobEvent::ChunkFailed { job_id, .. }
            | JobEvent::Finalized { job_id, .. }
            | JobEvent::Error { job_id, .. } => job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_shape() {
        let id = JobId::new();
        let event = JobEvent::StateChanged {
            job_id: id.clone(),
            from: JobState::Queued,
            to: JobState::Uploading,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stateChanged");
        assert_eq!(json["jobId"], id.as_str());
        assert_eq!(json["to"], "uploading");

        let failed = JobEvent::ChunkFailed {
            job_id: id.clone(),
            index: 3,
            attempts: 2,
            error: "timeout".into(),
            will_retry: true,
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["willRetry"], true);
        assert_eq!(failed.job_id(), &id);
    }
}
