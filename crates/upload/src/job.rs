//! Upload jobs and per-chunk transfer records.
//!
//! Everything here is owned by the scheduler task. Workers never touch a
//! job; they report outcomes and the scheduler applies them.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use paperdrop_protocol::{ChunkStatus, JobState, ProgressSnapshot, SessionRecord};
use paperdrop_transfer::{
    ChunkDescriptor, ChunkPlan, ContentCategory, FileDigests, SpeedCalculator, ValidatedFile,
    aggregate,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Opaque job identifier (UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable description of a hashed, accepted file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub mime: String,
    /// SHA-256 hex of the whole file.
    pub digest: String,
    pub category: ContentCategory,
}

impl FileDescriptor {
    fn new(file: &ValidatedFile, digest: String) -> Self {
        Self {
            name: file.name.clone(),
            path: file.path.clone(),
            size: file.size,
            mime: file.mime.clone(),
            digest,
            category: file.category,
        }
    }
}

/// Transfer state of one chunk of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkTransferRecord {
    pub attempts: u32,
    pub status: ChunkStatus,
    /// High-water mark of bytes delivered for this chunk.
    pub bytes_sent: u64,
    pub last_error: Option<String>,
    pub integrity_failures: u32,
    /// Earliest instant a pending chunk may be dispatched again.
    pub retry_at: Option<Instant>,
}

impl ChunkTransferRecord {
    fn new() -> Self {
        Self {
            attempts: 0,
            status: ChunkStatus::Pending,
            bytes_sent: 0,
            last_error: None,
            integrity_failures: 0,
            retry_at: None,
        }
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.status == ChunkStatus::Pending && self.retry_at.is_none_or(|at| at <= now)
    }
}

/// Read-only view of a job for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: JobId,
    pub file_name: String,
    pub state: JobState,
    pub priority: i32,
    pub bytes_sent: u64,
    pub bytes_total: u64,
    pub chunks_total: usize,
    pub chunks_acked: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Mutable aggregate for one submitted file.
pub(crate) struct UploadJob {
    pub id: JobId,
    pub file: ValidatedFile,
    pub plan: ChunkPlan,
    /// Set once hashing finishes.
    pub descriptor: Option<FileDescriptor>,
    pub chunks: Vec<ChunkDescriptor>,
    pub session_key: Option<String>,
    pub priority: i32,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub records: Vec<ChunkTransferRecord>,
    pub in_flight: usize,
    pub finalizing: bool,
    /// No session slot could be reserved; chunks wait until one frees.
    pub held: bool,
    pub cancel: CancellationToken,
    pub last_error: Option<String>,
    speed: SpeedCalculator,
    progress_tx: watch::Sender<ProgressSnapshot>,
}

impl UploadJob {
    pub fn new(
        id: JobId,
        file: ValidatedFile,
        plan: ChunkPlan,
        priority: i32,
        cancel: CancellationToken,
    ) -> Self {
        let records = vec![ChunkTransferRecord::new(); plan.len()];
        let (progress_tx, _) = watch::channel(ProgressSnapshot::empty(id.as_str(), file.size));
        Self {
            id,
            file,
            plan,
            descriptor: None,
            chunks: Vec::new(),
            session_key: None,
            priority,
            state: JobState::Validating,
            created_at: Utc::now(),
            records,
            in_flight: 0,
            finalizing: false,
            held: false,
            cancel,
            last_error: None,
            speed: SpeedCalculator::default(),
            progress_tx,
        }
    }

    /// Moves to `to`. Returns the previous state if it changed.
    pub fn set_state(&mut self, to: JobState) -> Option<JobState> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        Some(from)
    }

    pub fn is_hashed(&self) -> bool {
        self.descriptor.is_some()
    }

    /// Installs the hasher output and derives the session key.
    pub fn apply_digests(&mut self, digests: FileDigests, session_key: String) {
        self.descriptor = Some(FileDescriptor::new(&self.file, digests.digest));
        self.chunks = digests.chunks;
        self.session_key = Some(session_key);
    }

    /// Marks chunks listed in a matching session as acked. Returns how many
    /// chunks were skipped.
    pub fn apply_session(&mut self, session: &SessionRecord) -> usize {
        let mut skipped = 0;
        for &index in &session.acked_indices {
            let Some(record) = self.records.get_mut(index as usize) else {
                continue;
            };
            if record.status != ChunkStatus::Acked {
                record.status = ChunkStatus::Acked;
                record.bytes_sent = self.plan.spans[index as usize].length;
                skipped += 1;
            }
        }
        self.publish_progress();
        skipped
    }

    /// Lowest-index chunk that may be dispatched now.
    pub fn next_ready_chunk(&self, now: Instant) -> Option<u32> {
        if self.held || !self.is_hashed() || !self.state.is_admissible() {
            return None;
        }
        self.records
            .iter()
            .position(|r| r.is_ready(now))
            .map(|i| i as u32)
    }

    /// Earliest pending backoff deadline, if any chunk is waiting on one.
    pub fn next_retry_at(&self) -> Option<Instant> {
        if self.held || !self.state.is_admissible() {
            return None;
        }
        self.records
            .iter()
            .filter(|r| r.status == ChunkStatus::Pending)
            .filter_map(|r| r.retry_at)
            .min()
    }

    pub fn has_waiting_retries(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.status == ChunkStatus::Pending && r.retry_at.is_some())
    }

    pub fn all_acked(&self) -> bool {
        self.records.iter().all(|r| r.status == ChunkStatus::Acked)
    }

    pub fn acked_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == ChunkStatus::Acked)
            .map(|(i, _)| i as u32)
    }

    pub fn acked_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == ChunkStatus::Acked)
            .count()
    }

    /// Raises the byte high-water mark for a chunk. Returns the delta.
    pub fn record_progress(&mut self, index: u32, bytes: u64) -> u64 {
        let Some(record) = self.records.get_mut(index as usize) else {
            return 0;
        };
        let length = self.plan.spans[index as usize].length;
        let bytes = bytes.min(length);
        if bytes <= record.bytes_sent {
            return 0;
        }
        let delta = bytes - record.bytes_sent;
        record.bytes_sent = bytes;
        self.speed.add_sample(delta);
        delta
    }

    /// Clears failure bookkeeping so an explicit retry starts fresh.
    ///
    /// Acked chunks are kept.
    pub fn reset_for_retry(&mut self) {
        for record in &mut self.records {
            if record.status != ChunkStatus::Acked && record.status != ChunkStatus::InFlight {
                *record = ChunkTransferRecord::new();
            }
        }
        self.last_error = None;
        self.speed.reset();
        self.publish_progress();
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        aggregate(
            self.id.as_str(),
            self.file.size,
            self.records.iter().map(|r| r.bytes_sent),
            &self.speed,
        )
    }

    pub fn publish_progress(&self) {
        self.progress_tx.send_replace(self.snapshot());
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress_tx.subscribe()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.id.clone(),
            file_name: self.file.name.clone(),
            state: self.state,
            priority: self.priority,
            bytes_sent: self.records.iter().map(|r| r.bytes_sent).sum(),
            bytes_total: self.file.size,
            chunks_total: self.records.len(),
            chunks_acked: self.acked_count(),
            created_at: self.created_at,
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paperdrop_transfer::{ChunkPolicy, plan_chunks};
    use std::time::Duration;

    fn test_job(size: u64, chunk: u64) -> UploadJob {
        let file = ValidatedFile {
            path: PathBuf::from("/tmp/paper.pdf"),
            name: "paper.pdf".into(),
            size,
            mime: "application/pdf".into(),
            category: ContentCategory::Pdf,
        };
        let plan = plan_chunks(size, &ChunkPolicy::fixed(chunk)).unwrap();
        UploadJob::new(JobId::new(), file, plan, 0, CancellationToken::new())
    }

    fn hash(job: &mut UploadJob) {
        let chunks = job
            .plan
            .spans
            .iter()
            .map(|s| ChunkDescriptor {
                index: s.index,
                offset: s.offset,
                length: s.length,
                digest: format!("d{}", s.index),
            })
            .collect();
        job.apply_digests(
            FileDigests {
                digest: "whole".into(),
                chunks,
            },
            "key".into(),
        );
    }

    #[test]
    fn job_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
        assert_eq!(JobId::new().as_str().len(), 36);
    }

    #[test]
    fn new_job_is_validating() {
        let job = test_job(10, 4);
        assert_eq!(job.state, JobState::Validating);
        assert_eq!(job.records.len(), 3);
        assert!(!job.is_hashed());
    }

    #[test]
    fn set_state_reports_change_once() {
        let mut job = test_job(10, 4);
        assert_eq!(job.set_state(JobState::Queued), Some(JobState::Validating));
        assert_eq!(job.set_state(JobState::Queued), None);
    }

    #[test]
    fn unhashed_job_supplies_no_chunks() {
        let mut job = test_job(10, 4);
        job.set_state(JobState::Queued);
        assert_eq!(job.next_ready_chunk(Instant::now()), None);
        hash(&mut job);
        assert_eq!(job.next_ready_chunk(Instant::now()), Some(0));
    }

    #[test]
    fn held_job_supplies_no_chunks() {
        let mut job = test_job(10, 4);
        hash(&mut job);
        job.set_state(JobState::Queued);
        job.held = true;
        assert_eq!(job.next_ready_chunk(Instant::now()), None);
        job.held = false;
        assert_eq!(job.next_ready_chunk(Instant::now()), Some(0));
    }

    #[test]
    fn acked_indices_lists_acked_chunks() {
        let mut job = test_job(10, 4);
        job.records[0].status = ChunkStatus::Acked;
        job.records[2].status = ChunkStatus::Acked;
        assert_eq!(job.acked_indices().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn paused_job_supplies_no_chunks() {
        let mut job = test_job(10, 4);
        hash(&mut job);
        job.set_state(JobState::Paused);
        assert_eq!(job.next_ready_chunk(Instant::now()), None);
    }

    #[test]
    fn session_marks_acked_and_skips() {
        let mut job = test_job(10, 4);
        hash(&mut job);
        job.set_state(JobState::Queued);

        let mut session = SessionRecord::new("key", 10, 4);
        session.mark_acked(0);
        session.mark_acked(1);
        session.mark_acked(99);

        assert_eq!(job.apply_session(&session), 2);
        assert_eq!(job.next_ready_chunk(Instant::now()), Some(2));
        assert_eq!(job.snapshot().bytes_sent, 8);
        assert!(!job.all_acked());
    }

    #[test]
    fn retry_at_delays_dispatch() {
        let mut job = test_job(10, 4);
        hash(&mut job);
        job.set_state(JobState::Retrying);
        let now = Instant::now();
        for record in &mut job.records {
            record.retry_at = Some(now + Duration::from_secs(5));
        }
        assert_eq!(job.next_ready_chunk(now), None);
        assert_eq!(job.next_retry_at(), Some(now + Duration::from_secs(5)));
        assert_eq!(
            job.next_ready_chunk(now + Duration::from_secs(5)),
            Some(0)
        );
    }

    #[test]
    fn progress_is_a_high_water_mark() {
        let mut job = test_job(10, 4);
        assert_eq!(job.record_progress(0, 3), 3);
        assert_eq!(job.record_progress(0, 1), 0);
        assert_eq!(job.record_progress(0, 100), 1);
        assert_eq!(job.records[0].bytes_sent, 4);
        assert_eq!(job.snapshot().bytes_sent, 4);
    }

    #[test]
    fn reset_for_retry_keeps_acked() {
        let mut job = test_job(10, 4);
        hash(&mut job);
        job.records[0].status = ChunkStatus::Acked;
        job.records[0].bytes_sent = 4;
        job.records[1].status = ChunkStatus::Failed;
        job.records[1].attempts = 5;
        job.records[1].bytes_sent = 2;
        job.last_error = Some("boom".into());

        job.reset_for_retry();
        assert_eq!(job.records[0].status, ChunkStatus::Acked);
        assert_eq!(job.records[1].status, ChunkStatus::Pending);
        assert_eq!(job.records[1].attempts, 0);
        assert!(job.last_error.is_none());
        assert_eq!(job.summary().bytes_sent, 4);
    }

    #[test]
    fn summary_counts_chunks() {
        let mut job = test_job(10, 4);
        job.records[2].status = ChunkStatus::Acked;
        let summary = job.summary();
        assert_eq!(summary.chunks_total, 3);
        assert_eq!(summary.chunks_acked, 1);
        assert_eq!(summary.file_name, "paper.pdf");
        assert_eq!(summary.bytes_total, 10);
    }

    #[test]
    fn progress_subscribers_see_updates() {
        let mut job = test_job(10, 4);
        let rx = job.subscribe_progress();
        job.record_progress(1, 4);
        job.publish_progress();
        assert_eq!(rx.borrow().bytes_sent, 4);
    }
}
