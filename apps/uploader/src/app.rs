//! Subcommand implementations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::Utc;
use paperdrop_protocol::{JobState, SessionRecord};
use paperdrop_transfer::{FileSessionStore, SessionStore, hash_file, plan_chunks};
use paperdrop_upload::{HttpTransport, JobEvent, JobId, UploadManager};
use tokio::sync::broadcast::error::RecvError;

use crate::config::Config;

/// How often a progress line is logged per running job.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound for `--older-than`, about a century.
const MAX_AGE_HOURS: u64 = 24 * 365 * 100;

/// Uploads `files` and waits until every job has finished, failed or been
/// cancelled. Ctrl-C stops the pipeline and keeps sessions for the next run.
pub async fn upload(
    config: &Config,
    files: Vec<PathBuf>,
    priority: i32,
    mime: Option<String>,
) -> anyhow::Result<()> {
    let manager = start_manager(config)?;
    let mut events = manager.subscribe_events();

    let mut pending: HashMap<JobId, PathBuf> = HashMap::new();
    let mut rejected = 0usize;
    for file in files {
        match manager.submit_with_mime(&file, priority, mime.as_deref()).await {
            Ok(job) => {
                tracing::info!(job = %job, file = %file.display(), priority, "queued");
                pending.insert(job, file);
            }
            Err(e) => {
                tracing::error!(file = %file.display(), error = %e, "not queued");
                rejected += 1;
            }
        }
    }

    let mut failed = 0usize;
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !pending.is_empty() {
        tokio::select! {
            _ = &mut ctrl_c => {
                interrupt(&manager, pending.len()).await?;
                bail!("upload interrupted");
            }
            _ = ticker.tick() => log_progress(&manager).await,
            event = events.recv() => match event {
                Ok(event) => finished(&event, &mut pending, &mut failed),
                Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.shutdown().await?;
    if failed + rejected > 0 {
        bail!("{failed} upload(s) failed, {rejected} file(s) rejected");
    }
    Ok(())
}

fn start_manager(config: &Config) -> anyhow::Result<UploadManager> {
    let token = Some(config.auth_token.clone()).filter(|t| !t.is_empty());
    let transport = HttpTransport::new(&config.endpoint, token)?;
    let sessions = Arc::new(
        FileSessionStore::new(&config.session_dir)
            .with_context(|| format!("opening {}", config.session_dir.display()))?,
    );
    Ok(UploadManager::new(
        config.upload_config(),
        Arc::new(transport),
        sessions,
    )?)
}

/// Stops workers without cancelling jobs, so every session survives.
async fn interrupt(manager: &UploadManager, unfinished: usize) -> anyhow::Result<()> {
    tracing::warn!(
        jobs = unfinished,
        "interrupted, stopping uploads; sessions kept for resume"
    );
    manager.shutdown().await?;
    Ok(())
}

/// Logs `event` and drops the job from `pending` once it reaches a terminal
/// state.
fn finished(event: &JobEvent, pending: &mut HashMap<JobId, PathBuf>, failed: &mut usize) {
    match event {
        JobEvent::StateChanged { job_id, from, to } => {
            tracing::debug!(job = %job_id, %from, %to, "state changed");
            match to {
                JobState::Failed => {
                    if let Some(file) = pending.remove(job_id) {
                        tracing::error!(job = %job_id, file = %file.display(), "upload failed; session kept for resume");
                        *failed += 1;
                    }
                }
                JobState::Cancelled => {
                    pending.remove(job_id);
                }
                _ => {}
            }
        }
        JobEvent::ChunkAcked { job_id, index } => {
            tracing::debug!(job = %job_id, index, "chunk acked");
        }
        JobEvent::ChunkFailed {
            job_id,
            index,
            attempts,
            error,
            will_retry,
        } => {
            tracing::warn!(job = %job_id, index, attempts, will_retry, "chunk failed: {error}");
        }
        JobEvent::Finalized {
            job_id,
            file_id,
            location,
        } => {
            if let Some(file) = pending.remove(job_id) {
                tracing::info!(job = %job_id, file = %file.display(), %file_id, %location, "upload complete");
            }
        }
        JobEvent::Error { job_id, message } => {
            tracing::warn!(job = %job_id, "{message}");
        }
    }
}

async fn log_progress(manager: &UploadManager) {
    let Ok(jobs) = manager.jobs().await else {
        return;
    };
    if let Ok(total) = manager.progress().await
        && total.jobs > 1
    {
        tracing::info!(
            jobs = total.jobs,
            sent = total.bytes_sent,
            total = total.bytes_total,
            eta_secs = total.eta_secs.map(|s| s.round() as u64),
            "overall {:.1}%",
            total.percentage()
        );
    }
    for job in jobs.iter().filter(|j| !j.state.is_terminal()) {
        let percent = if job.bytes_total == 0 {
            0.0
        } else {
            job.bytes_sent as f64 * 100.0 / job.bytes_total as f64
        };
        tracing::info!(
            job = %job.job_id,
            file = %job.file_name,
            state = %job.state,
            chunks = format_args!("{}/{}", job.chunks_acked, job.chunks_total),
            "{percent:.1}%"
        );
    }
}

pub fn list_sessions(config: &Config) -> anyhow::Result<()> {
    let store = FileSessionStore::new(&config.session_dir)?;
    let records = load_all(&store)?;
    if records.is_empty() {
        println!("no saved sessions in {}", config.session_dir.display());
        return Ok(());
    }

    let now = Utc::now();
    for record in records {
        let age = now.signed_duration_since(record.created_at);
        println!(
            "{}  {:>12} bytes  {:>5}/{:<5} chunks  {}h old",
            record.session_key,
            record.file_size,
            record.acked_indices.len(),
            chunk_count(&record),
            age.num_hours()
        );
    }
    Ok(())
}

/// Removes saved sessions, optionally only those older than `older_than`
/// hours.
pub fn clear_sessions(config: &Config, older_than: Option<u64>) -> anyhow::Result<()> {
    let store = FileSessionStore::new(&config.session_dir)?;
    let cutoff = older_than.map(|h| Utc::now() - chrono::Duration::hours(h.min(MAX_AGE_HOURS) as i64));

    let mut removed = 0usize;
    for record in load_all(&store)? {
        if cutoff.is_none_or(|cutoff| record.created_at < cutoff)
            && store.remove(&record.session_key)?
        {
            removed += 1;
        }
    }
    tracing::info!(removed, dir = %config.session_dir.display(), "sessions cleared");
    println!("removed {removed} session(s)");
    Ok(())
}

fn load_all(store: &FileSessionStore) -> anyhow::Result<Vec<SessionRecord>> {
    let mut records = Vec::new();
    for key in store.keys()? {
        match store.load(&key) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "unreadable session"),
        }
    }
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(records)
}

fn chunk_count(record: &SessionRecord) -> u64 {
    if record.chunk_size == 0 {
        return 0;
    }
    record.file_size.div_ceil(record.chunk_size).max(1)
}

pub fn print_plan(config: &Config, file: &Path, digests: bool) -> anyhow::Result<()> {
    let size = std::fs::metadata(file)
        .with_context(|| format!("reading {}", file.display()))?
        .len();
    let plan = plan_chunks(size, &config.chunks)?;
    println!(
        "{}: {} bytes, {} chunk(s) of {} bytes",
        file.display(),
        plan.file_size,
        plan.len(),
        plan.chunk_size
    );

    let chunk_digests = if digests {
        let hashed = hash_file(file, &plan)?;
        println!("sha256 {}", hashed.digest);
        hashed.chunks.into_iter().map(|c| c.digest).collect()
    } else {
        Vec::new()
    };

    for span in &plan.spans {
        let digest = chunk_digests
            .get(span.index as usize)
            .map(String::as_str)
            .unwrap_or("");
        println!(
            "{:>6}  {:>12}  {:>10}  {}",
            span.index, span.offset, span.length, digest
        );
    }
    Ok(())
}
