//! Public handle to the upload pipeline.
//!
//! `UploadManager` validates and plans files on the caller's side, then
//! hands them to the scheduler task. Every other operation is a command
//! round-trip to that task.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use paperdrop_protocol::{GlobalProgress, ProgressSnapshot};
use paperdrop_protocol::constants::DEFAULT_ATTEMPT_TIMEOUT;
use paperdrop_transfer::{ChunkPolicy, SessionStore, Validator, ValidatorConfig, plan_chunks};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::error::UploadError;
use crate::events::JobEvent;
use crate::job::{JobId, JobSummary};
use crate::pool::WorkerPool;
use crate::retry::RetryPolicy;
use crate::scheduler::{Command, Scheduler, SchedulerLimits};
use crate::transport::ChunkTransport;

/// Capacity of the broadcast event channel.
const EVENT_CAPACITY: usize = 1024;

/// Capacity of the worker report channel.
const REPORT_CAPACITY: usize = 1024;

/// Tuning for an [`UploadManager`].
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Global bound on chunk attempts in flight, across all jobs.
    pub max_concurrent_chunks: usize,
    /// Jobs the queue holds before `submit` fails with `Capacity`.
    pub max_jobs: usize,
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
    pub chunk_policy: ChunkPolicy,
    pub validator: ValidatorConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: 4,
            max_jobs: 64,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            retry: RetryPolicy::default(),
            chunk_policy: ChunkPolicy::default(),
            validator: ValidatorConfig::default(),
        }
    }
}

/// Submits files and controls their upload jobs.
///
/// Dropping the manager stops the scheduler; sessions of unfinished jobs
/// stay in the store so a later run resumes them.
pub struct UploadManager {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<JobEvent>,
    validator: Validator,
    chunk_policy: ChunkPolicy,
}

impl UploadManager {
    /// Starts the scheduler and worker pool. Must be called inside a Tokio
    /// runtime.
    pub fn new(
        config: UploadConfig,
        transport: Arc<dyn ChunkTransport>,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Self, UploadError> {
        if config.max_concurrent_chunks == 0 {
            return Err(UploadError::Capacity(
                "max_concurrent_chunks must be at least 1".into(),
            ));
        }
        config.chunk_policy.validate()?;

        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (reports_tx, reports_rx) = mpsc::channel(REPORT_CAPACITY);
        let (tasks_tx, tasks_rx) = mpsc::channel(config.max_concurrent_chunks);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let pool = WorkerPool::spawn(
            config.max_concurrent_chunks,
            tasks_rx,
            Arc::clone(&transport),
            config.attempt_timeout,
            reports_tx.clone(),
        );
        let scheduler = Scheduler::new(
            SchedulerLimits {
                max_concurrent_chunks: config.max_concurrent_chunks,
                max_jobs: config.max_jobs,
                retry: config.retry.clone(),
            },
            sessions,
            transport,
            tasks_tx,
            reports_tx,
            events.clone(),
        );
        tokio::spawn(scheduler.run(commands_rx, reports_rx, pool));

        Ok(Self {
            commands: commands_tx,
            events,
            validator: Validator::new(config.validator),
            chunk_policy: config.chunk_policy,
        })
    }

    /// Validates, plans and enqueues `path`. Hashing continues in the
    /// background with the job in `Validating`.
    pub async fn submit(&self, path: impl AsRef<Path>, priority: i32) -> Result<JobId, UploadError> {
        self.submit_with_mime(path, priority, None).await
    }

    /// Like [`submit`](Self::submit) with an explicitly declared MIME type,
    /// which the content sniff must agree with.
    pub async fn submit_with_mime(
        &self,
        path: impl AsRef<Path>,
        priority: i32,
        declared_mime: Option<&str>,
    ) -> Result<JobId, UploadError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let validator = self.validator.clone();
        let mime = declared_mime.map(str::to_owned);
        let validated = tokio::task::spawn_blocking({
            let path = path.clone();
            move || validator.validate(&path, mime.as_deref())
        })
        .await
        .map_err(|e| UploadError::Io(std::io::Error::other(e)))?;

        let file = match validated {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "file rejected");
                return Err(e.into());
            }
        };
        let plan = plan_chunks(file.size, &self.chunk_policy)?;

        self.request(|reply| Command::Submit {
            file,
            plan,
            priority,
            reply,
        })
        .await?
    }

    /// Stops admitting chunks of `job_id`. In-flight chunks finish.
    pub async fn pause(&self, job_id: &JobId) -> Result<(), UploadError> {
        let job_id = job_id.clone();
        self.request(|reply| Command::Pause { job_id, reply }).await?
    }

    pub async fn resume(&self, job_id: &JobId) -> Result<(), UploadError> {
        let job_id = job_id.clone();
        self.request(|reply| Command::Resume { job_id, reply }).await?
    }

    /// Aborts in-flight chunks, discards the session and drops the job.
    pub async fn cancel(&self, job_id: &JobId) -> Result<(), UploadError> {
        let job_id = job_id.clone();
        self.request(|reply| Command::Cancel { job_id, reply }).await?
    }

    /// Re-queues a `Failed` job. Chunks already acked are not resent.
    pub async fn retry(&self, job_id: &JobId) -> Result<(), UploadError> {
        let job_id = job_id.clone();
        self.request(|reply| Command::Retry { job_id, reply }).await?
    }

    pub async fn reorder(&self, job_id: &JobId, priority: i32) -> Result<(), UploadError> {
        let job_id = job_id.clone();
        self.request(|reply| Command::Reorder {
            job_id,
            priority,
            reply,
        })
        .await?
    }

    /// Returns the current summary of `job_id`, or `None` once it has
    /// completed or been cancelled.
    pub async fn job(&self, job_id: &JobId) -> Result<Option<JobSummary>, UploadError> {
        let job_id = job_id.clone();
        self.request(|reply| Command::Job { job_id, reply }).await
    }

    /// Summaries of every job still in the queue, in admission order.
    pub async fn jobs(&self) -> Result<Vec<JobSummary>, UploadError> {
        self.request(|reply| Command::Jobs { reply }).await
    }

    pub async fn subscribe_progress(
        &self,
        job_id: &JobId,
    ) -> Result<watch::Receiver<ProgressSnapshot>, UploadError> {
        let job_id = job_id.clone();
        self.request(|reply| Command::SubscribeProgress { job_id, reply })
            .await?
    }

    /// Progress summed over every job the scheduler still holds, including
    /// paused and failed ones.
    pub async fn progress(&self) -> Result<GlobalProgress, UploadError> {
        self.request(|reply| Command::Progress { reply }).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Stops workers and the scheduler. Unfinished jobs keep their sessions.
    pub async fn shutdown(&self) -> Result<(), UploadError> {
        match self.request(|reply| Command::Shutdown { reply }).await {
            Ok(()) | Err(UploadError::Shutdown) => {
                info!("upload manager shut down");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, UploadError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| UploadError::Shutdown)?;
        rx.await.map_err(|_| UploadError::Shutdown)
    }
}
