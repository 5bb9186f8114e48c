use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "validating")]
    Validating,
    #[serde(rename = "uploading")]
    Uploading,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "retrying")]
    Retrying,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl JobState {
    /// Returns `true` for states a job never leaves on its own.
    ///
    /// `Failed` is terminal for scheduling purposes but can be re-entered
    /// into the queue by an explicit retry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Returns `true` if a job in this state may supply chunks to workers.
    pub fn is_admissible(self) -> bool {
        matches!(
            self,
            JobState::Queued | JobState::Uploading | JobState::Retrying
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Validating => "validating",
            JobState::Uploading => "uploading",
            JobState::Paused => "paused",
            JobState::Retrying => "retrying",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer status of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_flight")]
    InFlight,
    #[serde(rename = "acked")]
    Acked,
    #[serde(rename = "failed")]
    Failed,
}

/// Persisted resume state for one logical file.
///
/// Holds only the acknowledged chunk indices; progress is always derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_key: String,
    pub file_size: u64,
    pub chunk_size: u64,
    #[serde(default)]
    pub acked_indices: Vec<u32>,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Creates an empty record stamped with the current time.
    pub fn new(session_key: impl Into<String>, file_size: u64, chunk_size: u64) -> Self {
        Self {
            session_key: session_key.into(),
            file_size,
            chunk_size,
            acked_indices: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Adds `index` to the acked set. Returns `false` if it was already present.
    ///
    /// Indices are kept sorted so the persisted form is canonical.
    pub fn mark_acked(&mut self, index: u32) -> bool {
        match self.acked_indices.binary_search(&index) {
            Ok(_) => false,
            Err(pos) => {
                self.acked_indices.insert(pos, index);
                true
            }
        }
    }

    pub fn is_acked(&self, index: u32) -> bool {
        self.acked_indices.binary_search(&index).is_ok()
    }

    /// Returns `true` if this record was produced by the same chunk plan.
    pub fn matches_plan(&self, file_size: u64, chunk_size: u64) -> bool {
        self.file_size == file_size && self.chunk_size == chunk_size
    }
}

/// Point-in-time progress of one job. Never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub bytes_sent: u64,
    pub bytes_total: u64,
    /// Bytes per second over the recent sliding window.
    pub throughput: f64,
    /// `None` while throughput is zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
}

impl ProgressSnapshot {
    /// Returns an empty snapshot for a job that has not sent anything yet.
    pub fn empty(job_id: impl Into<String>, bytes_total: u64) -> Self {
        Self {
            job_id: job_id.into(),
            bytes_sent: 0,
            bytes_total,
            throughput: 0.0,
            eta_secs: None,
        }
    }

    /// Returns the progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        self.bytes_sent as f64 / self.bytes_total as f64 * 100.0
    }
}

/// Progress summed over every job the pipeline holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalProgress {
    pub jobs: usize,
    pub bytes_sent: u64,
    pub bytes_total: u64,
    pub throughput: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
}

impl GlobalProgress {
    pub fn percentage(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        self.bytes_sent as f64 / self.bytes_total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_serialization() {
        assert_eq!(
            serde_json::to_string(&JobState::Retrying).unwrap(),
            "\"retrying\""
        );
        let parsed: JobState = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, JobState::Cancelled);
    }

    #[test]
    fn job_state_admission() {
        assert!(JobState::Queued.is_admissible());
        assert!(JobState::Uploading.is_admissible());
        assert!(JobState::Retrying.is_admissible());
        assert!(!JobState::Paused.is_admissible());
        assert!(!JobState::Validating.is_admissible());
        assert!(!JobState::Failed.is_admissible());
    }

    #[test]
    fn chunk_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ChunkStatus::InFlight).unwrap(),
            "\"in_flight\""
        );
    }

    #[test]
    fn session_record_field_names() {
        let json = r#"{"sessionKey":"k","fileSize":10,"chunkSize":4,"ackedIndices":[0,2],"createdAt":"2024-01-01T00:00:00Z"}"#;
        let record: SessionRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.session_key, "k");
        assert_eq!(record.acked_indices, vec![0, 2]);
        assert!(record.matches_plan(10, 4));
        assert!(!record.matches_plan(10, 8));
    }

    #[test]
    fn session_record_mark_acked_sorted_and_deduped() {
        let mut record = SessionRecord::new("k", 100, 10);
        assert!(record.mark_acked(5));
        assert!(record.mark_acked(1));
        assert!(!record.mark_acked(5));
        assert!(record.mark_acked(3));
        assert_eq!(record.acked_indices, vec![1, 3, 5]);
        assert!(record.is_acked(3));
        assert!(!record.is_acked(4));
    }

    #[test]
    fn progress_percentage() {
        let mut p = ProgressSnapshot::empty("j", 1000);
        p.bytes_sent = 250;
        assert!((p.percentage() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn global_progress_percentage() {
        let g = GlobalProgress {
            jobs: 2,
            bytes_sent: 30,
            bytes_total: 120,
            ..GlobalProgress::default()
        };
        assert!((g.percentage() - 25.0).abs() < f64::EPSILON);
        assert_eq!(GlobalProgress::default().percentage(), 0.0);
    }

    #[test]
    fn progress_percentage_zero_total() {
        let p = ProgressSnapshot::empty("j", 0);
        assert!((p.percentage() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn progress_omits_unknown_eta() {
        let p = ProgressSnapshot::empty("j", 10);
        let json = serde_json::to_string(&p).unwrap();
        assert!(!json.contains("etaSecs"));
        assert!(json.contains("bytesTotal"));
    }
}
