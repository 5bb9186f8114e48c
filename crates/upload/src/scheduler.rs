//! Single owner of all upload state.
//!
//! One task holds the job table, the priority queue, the global in-flight
//! counter and every retry deadline. The public API reaches it through
//! [`Command`]s; workers, hashers and finalizers reach it through
//! [`Report`]s. Nothing else mutates a job, so "a chunk just acked" and
//! "the user paused the job" can never race.

use std::collections::HashMap;
use std::sync::Arc;

use paperdrop_protocol::constants::FINALIZE_TIMEOUT;
use paperdrop_protocol::{
    ChunkStatus, FinalizeRequest, FinalizeResponse, GlobalProgress, JobState, ProgressSnapshot,
    SessionRecord,
};
use paperdrop_transfer::{
    ChunkPlan, FileDigests, SessionError, SessionStore, TransferError, ValidatedFile,
    aggregate_global, hash_file, session_key,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::UploadError;
use crate::events::JobEvent;
use crate::job::{JobId, JobSummary, UploadJob};
use crate::pool::{ChunkTask, WorkerPool};
use crate::queue::PriorityQueue;
use crate::retry::{FailureKind, RetryDecision, RetryPolicy};
use crate::transport::ChunkTransport;

type Reply<T> = oneshot::Sender<Result<T, UploadError>>;

/// Requests from the public API.
pub(crate) enum Command {
    Submit {
        file: ValidatedFile,
        plan: ChunkPlan,
        priority: i32,
        reply: Reply<JobId>,
    },
    Pause { job_id: JobId, reply: Reply<()> },
    Resume { job_id: JobId, reply: Reply<()> },
    Cancel { job_id: JobId, reply: Reply<()> },
    Retry { job_id: JobId, reply: Reply<()> },
    Reorder {
        job_id: JobId,
        priority: i32,
        reply: Reply<()>,
    },
    Job {
        job_id: JobId,
        reply: oneshot::Sender<Option<JobSummary>>,
    },
    Jobs {
        reply: oneshot::Sender<Vec<JobSummary>>,
    },
    SubscribeProgress {
        job_id: JobId,
        reply: Reply<watch::Receiver<ProgressSnapshot>>,
    },
    Progress {
        reply: oneshot::Sender<GlobalProgress>,
    },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Outcomes flowing back from background work.
pub(crate) enum Report {
    Hashed {
        job_id: JobId,
        result: Result<FileDigests, TransferError>,
    },
    /// Cumulative bytes sent in the current attempt.
    Progress { job_id: JobId, index: u32, bytes: u64 },
    Acked { job_id: JobId, index: u32 },
    Failed {
        job_id: JobId,
        index: u32,
        error: UploadError,
    },
    /// The attempt was cancelled before it finished.
    Aborted { job_id: JobId, index: u32 },
    Finalized {
        job_id: JobId,
        result: Result<FinalizeResponse, UploadError>,
    },
}

/// Limits the scheduler enforces.
#[derive(Debug, Clone)]
pub(crate) struct SchedulerLimits {
    pub max_concurrent_chunks: usize,
    pub max_jobs: usize,
    pub retry: RetryPolicy,
}

pub(crate) struct Scheduler {
    limits: SchedulerLimits,
    jobs: HashMap<JobId, UploadJob>,
    queue: PriorityQueue,
    in_flight: usize,
    next_seq: u64,
    /// Jobs cancelled while hashing, by file size. Their session key is only
    /// known once the digest arrives.
    cancelled_unhashed: HashMap<JobId, u64>,
    sessions: Arc<dyn SessionStore>,
    transport: Arc<dyn ChunkTransport>,
    tasks: mpsc::Sender<ChunkTask>,
    reports_tx: mpsc::Sender<Report>,
    events: broadcast::Sender<JobEvent>,
    /// Parent of every job's cancellation token.
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        limits: SchedulerLimits,
        sessions: Arc<dyn SessionStore>,
        transport: Arc<dyn ChunkTransport>,
        tasks: mpsc::Sender<ChunkTask>,
        reports_tx: mpsc::Sender<Report>,
        events: broadcast::Sender<JobEvent>,
    ) -> Self {
        Self {
            limits,
            jobs: HashMap::new(),
            queue: PriorityQueue::new(),
            in_flight: 0,
            next_seq: 0,
            cancelled_unhashed: HashMap::new(),
            sessions,
            transport,
            tasks,
            reports_tx,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Runs until a shutdown command arrives or every API handle is dropped.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut reports: mpsc::Receiver<Report>,
        pool: WorkerPool,
    ) {
        info!(
            workers = pool.size(),
            max_jobs = self.limits.max_jobs,
            "upload scheduler started"
        );

        let shutdown_reply = loop {
            self.dispatch();
            let wake = self.next_wake();

            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Some(reply) = self.handle_command(command) {
                            break Some(reply);
                        }
                    }
                    None => break None,
                },
                Some(report) = reports.recv() => self.handle_report(report),
                _ = wait_until(wake) => {}
            }
        };

        // Jobs stay in place; their sessions survive for the next run.
        self.shutdown.cancel();
        let Scheduler { tasks, jobs, .. } = self;
        drop(tasks);
        drop(reports);
        pool.join().await;
        info!(unfinished = jobs.len(), "upload scheduler stopped");

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Hands ready chunks to workers, in queue order, while slots are free.
    fn dispatch(&mut self) {
        let now = Instant::now();
        while self.in_flight < self.limits.max_concurrent_chunks {
            let Some((job_id, index)) = self.next_ready(now) else {
                break;
            };
            let Some(job) = self.jobs.get_mut(&job_id) else {
                break;
            };

            let record = &mut job.records[index as usize];
            record.status = ChunkStatus::InFlight;
            record.attempts += 1;
            record.retry_at = None;
            let attempt = record.attempts;

            let task = ChunkTask {
                job_id: job_id.clone(),
                session_key: job.session_key.clone().unwrap_or_default(),
                path: job.file.path.clone(),
                chunk: job.chunks[index as usize].clone(),
                attempt,
                cancel: job.cancel.clone(),
            };

            if let Err(e) = self.tasks.try_send(task) {
                // Capacity equals the slot count, so only a closed pool lands here.
                error!(job = %job_id, index, error = %e, "worker pool unavailable");
                let record = &mut job.records[index as usize];
                record.status = ChunkStatus::Pending;
                record.attempts -= 1;
                break;
            }

            job.in_flight += 1;
            self.in_flight += 1;
            debug!(job = %job_id, index, attempt, in_flight = self.in_flight, "chunk dispatched");

            if !job.has_waiting_retries() {
                self.transition(&job_id, JobState::Uploading);
            }
        }
    }

    fn next_ready(&self, now: Instant) -> Option<(JobId, u32)> {
        self.queue.iter().find_map(|id| {
            let job = self.jobs.get(id)?;
            job.next_ready_chunk(now).map(|index| (id.clone(), index))
        })
    }

    fn next_wake(&self) -> Option<Instant> {
        self.jobs.values().filter_map(UploadJob::next_retry_at).min()
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Applies one command. Returns the reply handle on shutdown.
    fn handle_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Submit {
                file,
                plan,
                priority,
                reply,
            } => {
                let _ = reply.send(self.submit(file, plan, priority));
            }
            Command::Pause { job_id, reply } => {
                let _ = reply.send(self.pause(&job_id));
            }
            Command::Resume { job_id, reply } => {
                let _ = reply.send(self.resume(&job_id));
            }
            Command::Cancel { job_id, reply } => {
                let _ = reply.send(self.cancel(&job_id));
            }
            Command::Retry { job_id, reply } => {
                let _ = reply.send(self.retry(&job_id));
            }
            Command::Reorder {
                job_id,
                priority,
                reply,
            } => {
                let _ = reply.send(self.reorder(&job_id, priority));
            }
            Command::Job { job_id, reply } => {
                let _ = reply.send(self.jobs.get(&job_id).map(UploadJob::summary));
            }
            Command::Jobs { reply } => {
                let summaries = self
                    .queue
                    .iter()
                    .filter_map(|id| self.jobs.get(id))
                    .map(UploadJob::summary)
                    .collect();
                let _ = reply.send(summaries);
            }
            Command::SubscribeProgress { job_id, reply } => {
                let result = self
                    .jobs
                    .get(&job_id)
                    .map(UploadJob::subscribe_progress)
                    .ok_or(UploadError::JobNotFound(job_id));
                let _ = reply.send(result);
            }
            Command::Progress { reply } => {
                let snapshots: Vec<ProgressSnapshot> =
                    self.jobs.values().map(UploadJob::snapshot).collect();
                let _ = reply.send(aggregate_global(&snapshots));
            }
            Command::Shutdown { reply } => return Some(reply),
        }
        None
    }

    fn submit(&mut self, file: ValidatedFile, plan: ChunkPlan, priority: i32) -> Result<JobId, UploadError> {
        if self.jobs.len() >= self.limits.max_jobs {
            warn!(file = %file.name, max_jobs = self.limits.max_jobs, "upload queue full");
            return Err(UploadError::Capacity(format!(
                "queue already holds {} jobs",
                self.limits.max_jobs
            )));
        }

        let job_id = JobId::new();
        let seq = self.next_seq;
        self.next_seq += 1;

        info!(
            job = %job_id,
            file = %file.name,
            size = file.size,
            chunks = plan.len(),
            chunk_size = plan.chunk_size,
            priority,
            "job submitted"
        );

        let job = UploadJob::new(
            job_id.clone(),
            file,
            plan,
            priority,
            self.shutdown.child_token(),
        );
        self.spawn_hash(&job);
        self.queue.push(job_id.clone(), priority, seq);
        self.jobs.insert(job_id.clone(), job);
        Ok(job_id)
    }

    fn pause(&mut self, job_id: &JobId) -> Result<(), UploadError> {
        let state = self.state_of(job_id)?;
        match state {
            JobState::Validating | JobState::Queued | JobState::Uploading | JobState::Retrying => {
                self.transition(job_id, JobState::Paused);
                Ok(())
            }
            _ => Err(invalid(job_id, state, "pause")),
        }
    }

    fn resume(&mut self, job_id: &JobId) -> Result<(), UploadError> {
        let state = self.state_of(job_id)?;
        if state != JobState::Paused {
            return Err(invalid(job_id, state, "resume"));
        }
        let Some(job) = self.jobs.get(job_id) else {
            return Err(UploadError::JobNotFound(job_id.clone()));
        };
        let next = if !job.is_hashed() {
            JobState::Validating
        } else if job.in_flight > 0 {
            JobState::Uploading
        } else {
            JobState::Queued
        };
        self.transition(job_id, next);
        self.maybe_finalize(job_id);
        Ok(())
    }

    fn cancel(&mut self, job_id: &JobId) -> Result<(), UploadError> {
        let Some(mut job) = self.jobs.remove(job_id) else {
            return Err(UploadError::JobNotFound(job_id.clone()));
        };
        self.queue.remove(job_id);
        job.cancel.cancel();

        match &job.session_key {
            Some(key) => self.discard_session(job_id, key),
            // Hashing is still running; its report names the session.
            None if job.state != JobState::Failed => {
                self.cancelled_unhashed.insert(job_id.clone(), job.file.size);
            }
            None => {}
        }

        if let Some(from) = job.set_state(JobState::Cancelled) {
            self.emit(JobEvent::StateChanged {
                job_id: job_id.clone(),
                from,
                to: JobState::Cancelled,
            });
        }
        info!(job = %job_id, in_flight = job.in_flight, "job cancelled");
        Ok(())
    }

    fn retry(&mut self, job_id: &JobId) -> Result<(), UploadError> {
        let state = self.state_of(job_id)?;
        if state != JobState::Failed {
            return Err(invalid(job_id, state, "retry"));
        }
        let Some(job) = self.jobs.get_mut(job_id) else {
            return Err(UploadError::JobNotFound(job_id.clone()));
        };
        job.reset_for_retry();
        info!(job = %job_id, acked = job.acked_count(), "job retried");

        if !job.is_hashed() {
            self.transition(job_id, JobState::Validating);
            if let Some(job) = self.jobs.get(job_id) {
                self.spawn_hash(job);
            }
        } else {
            self.transition(job_id, JobState::Queued);
            self.maybe_finalize(job_id);
        }
        Ok(())
    }

    fn reorder(&mut self, job_id: &JobId, priority: i32) -> Result<(), UploadError> {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return Err(UploadError::JobNotFound(job_id.clone()));
        };
        job.priority = priority;
        self.queue.reprioritize(job_id, priority);
        debug!(job = %job_id, priority, "job reprioritized");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reports
    // -----------------------------------------------------------------------

    fn handle_report(&mut self, report: Report) {
        match report {
            Report::Hashed { job_id, result } => self.on_hashed(job_id, result),
            Report::Progress {
                job_id,
                index,
                bytes,
            } => {
                if let Some(job) = self.jobs.get_mut(&job_id)
                    && job.records[index as usize].status == ChunkStatus::InFlight
                    && job.record_progress(index, bytes) > 0
                {
                    job.publish_progress();
                }
            }
            Report::Acked { job_id, index } => self.on_acked(job_id, index),
            Report::Failed {
                job_id,
                index,
                error,
            } => self.on_failed(job_id, index, error),
            Report::Aborted { job_id, index } => {
                self.release_slot();
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.in_flight = job.in_flight.saturating_sub(1);
                    let record = &mut job.records[index as usize];
                    record.status = ChunkStatus::Pending;
                    record.attempts = record.attempts.saturating_sub(1);
                }
                debug!(job = %job_id, index, "chunk attempt aborted");
            }
            Report::Finalized { job_id, result } => self.on_finalized(job_id, result),
        }
    }

    fn on_hashed(&mut self, job_id: JobId, result: Result<FileDigests, TransferError>) {
        if !self.jobs.contains_key(&job_id) {
            if let Some(size) = self.cancelled_unhashed.remove(&job_id)
                && let Ok(digests) = &result
            {
                self.discard_session(&job_id, &session_key(&digests.digest, size));
            }
            debug!(job = %job_id, "discarding digests for removed job");
            return;
        }
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };

        let digests = match result {
            Ok(digests) => digests,
            Err(e) => {
                error!(job = %job_id, error = %e, "hashing failed");
                job.last_error = Some(e.to_string());
                self.transition(&job_id, JobState::Failed);
                return;
            }
        };

        let key = session_key(&digests.digest, job.file.size);
        job.apply_digests(digests, key.clone());

        let mut store_error = None;
        let mut resumed = false;
        match self.sessions.load(&key) {
            Ok(Some(session)) if session.matches_plan(job.plan.file_size, job.plan.chunk_size) => {
                let skipped = job.apply_session(&session);
                resumed = true;
                info!(job = %job_id, session = %key, skipped, "resuming from stored session");
            }
            Ok(Some(_)) => {
                warn!(job = %job_id, session = %key, "discarding session from a different chunk plan");
                if let Err(e) = self.sessions.remove(&key) {
                    store_error = Some(e.to_string());
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(job = %job_id, session = %key, error = %e, "failed to load session");
                store_error = Some(e.to_string());
            }
        }
        let paused = job.state == JobState::Paused;
        debug!(job = %job_id, session = %key, "hashing complete");

        if let Some(message) = store_error {
            self.emit(JobEvent::Error {
                job_id: job_id.clone(),
                message,
            });
        }
        if !resumed {
            self.reserve_session(&job_id);
        }
        if !paused {
            self.transition(&job_id, JobState::Queued);
            self.maybe_finalize(&job_id);
        }
    }

    fn on_acked(&mut self, job_id: JobId, index: u32) {
        self.release_slot();
        let Some(job) = self.jobs.get_mut(&job_id) else {
            debug!(job = %job_id, index, "discarding ack for removed job");
            return;
        };
        job.in_flight = job.in_flight.saturating_sub(1);

        let length = job.chunks[index as usize].length;
        let record = &mut job.records[index as usize];
        record.status = ChunkStatus::Acked;
        record.last_error = None;
        job.record_progress(index, length);
        job.publish_progress();

        let mut store_error = None;
        if let Some(key) = &job.session_key
            && let Err(e) = self
                .sessions
                .record_ack(key, job.plan.file_size, job.plan.chunk_size, index)
        {
            warn!(job = %job_id, index, error = %e, "failed to persist ack");
            store_error = Some(match e {
                SessionError::Full { capacity } => {
                    // The record is gone and the store has no room for it.
                    job.held = true;
                    job.last_error = Some(capacity_message(capacity));
                    UploadError::Capacity(capacity_message(capacity)).to_string()
                }
                e => e.to_string(),
            });
        }
        let held = job.held;
        debug!(job = %job_id, index, acked = job.acked_count(), total = job.records.len(), "chunk acked");

        self.emit(JobEvent::ChunkAcked {
            job_id: job_id.clone(),
            index,
        });
        if let Some(message) = store_error {
            self.emit(JobEvent::Error {
                job_id: job_id.clone(),
                message,
            });
        }
        if held && matches!(self.state_of(&job_id), Ok(JobState::Uploading | JobState::Retrying)) {
            self.transition(&job_id, JobState::Queued);
        }
        self.maybe_finalize(&job_id);
    }

    fn on_failed(&mut self, job_id: JobId, index: u32, error: UploadError) {
        self.release_slot();
        let Some(job) = self.jobs.get_mut(&job_id) else {
            debug!(job = %job_id, index, "discarding failure for removed job");
            return;
        };
        job.in_flight = job.in_flight.saturating_sub(1);

        let kind = error.failure_kind().unwrap_or(FailureKind::Fatal);
        let record = &mut job.records[index as usize];
        if kind == FailureKind::Integrity {
            record.integrity_failures += 1;
        }
        record.last_error = Some(error.to_string());
        let attempts = record.attempts;

        let decision = if job.state == JobState::Failed {
            RetryDecision::GiveUp
        } else {
            self.limits
                .retry
                .decide(kind, attempts, record.integrity_failures)
        };

        match decision {
            RetryDecision::Retry(delay) => {
                record.status = ChunkStatus::Pending;
                record.retry_at = Some(Instant::now() + delay);
                warn!(
                    job = %job_id,
                    index,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "chunk attempt failed, retrying"
                );
                let state = job.state;
                self.emit(JobEvent::ChunkFailed {
                    job_id: job_id.clone(),
                    index,
                    attempts,
                    error: error.to_string(),
                    will_retry: true,
                });
                if matches!(state, JobState::Queued | JobState::Uploading) {
                    self.transition(&job_id, JobState::Retrying);
                }
            }
            RetryDecision::GiveUp => {
                record.status = ChunkStatus::Failed;
                let already_failed = job.state == JobState::Failed;
                if !already_failed {
                    job.last_error = Some(format!("chunk {index}: {error}"));
                    error!(job = %job_id, index, attempts, error = %error, "chunk failed, job failed");
                }
                self.emit(JobEvent::ChunkFailed {
                    job_id: job_id.clone(),
                    index,
                    attempts,
                    error: error.to_string(),
                    will_retry: false,
                });
                if !already_failed {
                    self.transition(&job_id, JobState::Failed);
                }
            }
        }
    }

    fn on_finalized(&mut self, job_id: JobId, result: Result<FinalizeResponse, UploadError>) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        job.finalizing = false;

        match result {
            Ok(response) => {
                let key = job.session_key.clone();
                info!(job = %job_id, file = %job.file.name, file_id = %response.file_id, "upload finalized");
                self.transition(&job_id, JobState::Completed);
                self.jobs.remove(&job_id);
                self.queue.remove(&job_id);
                if let Some(key) = key {
                    self.discard_session(&job_id, &key);
                }
                self.emit(JobEvent::Finalized {
                    job_id: job_id.clone(),
                    file_id: response.file_id,
                    location: response.location,
                });
            }
            Err(e) => {
                error!(job = %job_id, error = %e, "finalize failed");
                job.last_error = Some(format!("finalize: {e}"));
                self.transition(&job_id, JobState::Failed);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Creates the job's session record before any chunk is sent. A full
    /// store holds the job in the queue until another session is removed.
    fn reserve_session(&mut self, job_id: &JobId) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        let Some(key) = job.session_key.clone() else {
            return;
        };
        let mut record = SessionRecord::new(&key, job.plan.file_size, job.plan.chunk_size);
        for index in job.acked_indices() {
            record.mark_acked(index);
        }

        let result = self.sessions.update(&key, &mut |slot| {
            if slot.is_none() {
                *slot = Some(record.clone());
            }
        });
        let message = match result {
            Ok(_) => {
                if job.held {
                    info!(job = %job_id, session = %key, "session slot free, job released");
                    job.held = false;
                    job.last_error = None;
                }
                None
            }
            Err(SessionError::Full { capacity }) => {
                if job.held {
                    None
                } else {
                    let error = UploadError::Capacity(capacity_message(capacity));
                    warn!(job = %job_id, session = %key, %error, "job held until a session slot frees");
                    job.held = true;
                    job.last_error = Some(capacity_message(capacity));
                    Some(error.to_string())
                }
            }
            Err(e) => {
                warn!(job = %job_id, session = %key, error = %e, "failed to create session");
                Some(e.to_string())
            }
        };
        if let Some(message) = message {
            self.emit(JobEvent::Error {
                job_id: job_id.clone(),
                message,
            });
        }
    }

    /// Retries the reservation of every held job, in queue order.
    fn release_held(&mut self) {
        let held: Vec<JobId> = self
            .queue
            .iter()
            .filter(|id| self.jobs.get(*id).is_some_and(|job| job.held))
            .cloned()
            .collect();
        for job_id in held {
            self.reserve_session(&job_id);
        }
    }

    fn discard_session(&mut self, job_id: &JobId, key: &str) {
        match self.sessions.remove(key) {
            Ok(true) => {
                debug!(job = %job_id, session = %key, "session discarded");
                self.release_held();
            }
            Ok(false) => {}
            Err(e) => warn!(job = %job_id, session = %key, error = %e, "failed to discard session"),
        }
    }

    fn release_slot(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    fn state_of(&self, job_id: &JobId) -> Result<JobState, UploadError> {
        self.jobs
            .get(job_id)
            .map(|job| job.state)
            .ok_or_else(|| UploadError::JobNotFound(job_id.clone()))
    }

    fn transition(&mut self, job_id: &JobId, to: JobState) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        if let Some(from) = job.set_state(to) {
            debug!(job = %job_id, %from, %to, "job state changed");
            self.emit(JobEvent::StateChanged {
                job_id: job_id.clone(),
                from,
                to,
            });
        }
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn spawn_hash(&self, job: &UploadJob) {
        let job_id = job.id.clone();
        let path = job.file.path.clone();
        let plan = job.plan.clone();
        let reports = self.reports_tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || hash_file(&path, &plan))
                .await
                .unwrap_or_else(|e| Err(TransferError::Io(std::io::Error::other(e))));
            let _ = reports.send(Report::Hashed { job_id, result }).await;
        });
    }

    /// Starts the finalize call once every chunk is acked.
    fn maybe_finalize(&mut self, job_id: &JobId) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        if job.finalizing || !job.is_hashed() || !job.state.is_admissible() || !job.all_acked() {
            return;
        }
        let Some(descriptor) = &job.descriptor else {
            return;
        };
        job.finalizing = true;

        let request = FinalizeRequest {
            file_name: descriptor.name.clone(),
            file_size: descriptor.size,
            digest: descriptor.digest.clone(),
            mime_type: descriptor.mime.clone(),
            chunk_count: job.records.len() as u32,
        };
        let session_key = job.session_key.clone().unwrap_or_default();
        info!(job = %job_id, session = %session_key, "all chunks acked, finalizing");

        tokio::spawn(finalize_with_retry(
            Arc::clone(&self.transport),
            session_key,
            request,
            self.limits.retry.clone(),
            job.cancel.clone(),
            self.reports_tx.clone(),
            job_id.clone(),
        ));
        self.transition(job_id, JobState::Uploading);
    }
}

fn capacity_message(capacity: usize) -> String {
    format!("session store full ({capacity} sessions)")
}

fn invalid(job_id: &JobId, state: JobState, action: &'static str) -> UploadError {
    UploadError::InvalidState {
        job: job_id.clone(),
        state,
        action,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Calls finalize under the chunk retry policy. Reports nothing if the job
/// is cancelled first.
async fn finalize_with_retry(
    transport: Arc<dyn ChunkTransport>,
    session_key: String,
    request: FinalizeRequest,
    retry: RetryPolicy,
    cancel: CancellationToken,
    reports: mpsc::Sender<Report>,
    job_id: JobId,
) {
    let mut attempt = 0;
    let mut integrity_failures = 0;
    let result = loop {
        attempt += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = tokio::time::timeout(
                FINALIZE_TIMEOUT,
                transport.finalize(session_key.clone(), request.clone()),
            ) => match result {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(UploadError::from(e)),
                Err(_) => Err(UploadError::TransientTransport("finalize timed out".into())),
            },
        };

        let error = match outcome {
            Ok(response) => break Ok(response),
            Err(UploadError::Cancelled) => return,
            Err(e) => e,
        };
        let kind = error.failure_kind().unwrap_or(FailureKind::Fatal);
        if kind == FailureKind::Integrity {
            integrity_failures += 1;
        }
        match retry.decide(kind, attempt, integrity_failures) {
            RetryDecision::Retry(delay) => {
                warn!(job = %job_id, attempt, error = %error, "finalize failed, retrying");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            RetryDecision::GiveUp => break Err(error),
        }
    };

    let _ = reports.send(Report::Finalized { job_id, result }).await;
}
