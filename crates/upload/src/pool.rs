//! Fixed-size chunk worker pool.
//!
//! Workers pull [`ChunkTask`]s from one shared channel. The scheduler only
//! sends a task when a slot is free, so the channel itself is the admission
//! gate and the pool never runs more than `size` attempts at once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use paperdrop_transfer::{ChunkDescriptor, ChunkReader, verify_chunk};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::UploadError;
use crate::job::JobId;
use crate::scheduler::Report;
use crate::transport::{ChunkPayload, ChunkTransport, ProgressFn};

/// One attempt at one chunk.
#[derive(Debug, Clone)]
pub(crate) struct ChunkTask {
    pub job_id: JobId,
    pub session_key: String,
    pub path: PathBuf,
    pub chunk: ChunkDescriptor,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// Handles to the running workers.
pub(crate) struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers. They exit once every task sender is dropped.
    pub fn spawn(
        size: usize,
        tasks: mpsc::Receiver<ChunkTask>,
        transport: Arc<dyn ChunkTransport>,
        attempt_timeout: Duration,
        reports: mpsc::Sender<Report>,
    ) -> Self {
        let tasks = Arc::new(Mutex::new(tasks));
        let workers = (0..size)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&tasks),
                    Arc::clone(&transport),
                    attempt_timeout,
                    reports.clone(),
                ))
            })
            .collect();
        Self { workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every worker to exit.
    pub async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(
    worker: usize,
    tasks: Arc<Mutex<mpsc::Receiver<ChunkTask>>>,
    transport: Arc<dyn ChunkTransport>,
    attempt_timeout: Duration,
    reports: mpsc::Sender<Report>,
) {
    loop {
        let task = { tasks.lock().await.recv().await };
        let Some(task) = task else {
            break;
        };

        trace!(worker, job = %task.job_id, index = task.chunk.index, attempt = task.attempt, "attempt started");
        let result = run_attempt(&task, transport.as_ref(), attempt_timeout, &reports).await;

        let report = match result {
            Ok(()) => Report::Acked {
                job_id: task.job_id,
                index: task.chunk.index,
            },
            Err(UploadError::Cancelled) => Report::Aborted {
                job_id: task.job_id,
                index: task.chunk.index,
            },
            Err(error) => Report::Failed {
                job_id: task.job_id,
                index: task.chunk.index,
                error,
            },
        };
        if reports.send(report).await.is_err() {
            break;
        }
    }
    debug!(worker, "worker stopped");
}

/// Performs one attempt: read the span, verify it, hand it to the transport.
///
/// Returns `Err(UploadError::Cancelled)` for an aborted attempt. A
/// cancelled attempt never reports success.
pub(crate) async fn run_attempt(
    task: &ChunkTask,
    transport: &dyn ChunkTransport,
    attempt_timeout: Duration,
    reports: &mpsc::Sender<Report>,
) -> Result<(), UploadError> {
    if task.cancel.is_cancelled() {
        return Err(UploadError::Cancelled);
    }

    let data = tokio::task::spawn_blocking({
        let path = task.path.clone();
        let chunk = task.chunk.clone();
        move || -> Result<Vec<u8>, UploadError> {
            let mut reader = ChunkReader::new(&path)?;
            let data = reader.read_span(&chunk.span())?;
            verify_chunk(chunk.index, &data, &chunk.digest)?;
            Ok(data)
        }
    })
    .await
    .map_err(|e| UploadError::Io(std::io::Error::other(e)))??;

    if task.cancel.is_cancelled() {
        return Err(UploadError::Cancelled);
    }

    let progress: ProgressFn = {
        let reports = reports.clone();
        let job_id = task.job_id.clone();
        let index = task.chunk.index;
        Arc::new(move |bytes| {
            // Lossy: a later report carries the cumulative count.
            let _ = reports.try_send(Report::Progress {
                job_id: job_id.clone(),
                index,
                bytes,
            });
        })
    };

    let payload = ChunkPayload {
        session_key: task.session_key.clone(),
        index: task.chunk.index,
        digest: task.chunk.digest.clone(),
        data: Bytes::from(data),
    };

    tokio::select! {
        biased;
        _ = task.cancel.cancelled() => Err(UploadError::Cancelled),
        result = tokio::time::timeout(
            attempt_timeout,
            transport.put_chunk(payload, progress, task.cancel.clone()),
        ) => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(UploadError::TransientTransport(format!(
                "attempt timed out after {}s",
                attempt_timeout.as_secs_f64()
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::FailureKind;
    use crate::transport::TransportError;
    use paperdrop_protocol::{FinalizeRequest, FinalizeResponse};
    use paperdrop_transfer::checksum_bytes;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;

    /// Records payloads; acks unless told to fail or hang.
    #[derive(Default)]
    struct MockTransport {
        received: StdMutex<Vec<(u32, Vec<u8>)>>,
        fail_with: Option<TransportError>,
        hang: bool,
    }

    impl ChunkTransport for MockTransport {
        fn put_chunk(
            &self,
            chunk: ChunkPayload,
            progress: ProgressFn,
            _cancel: CancellationToken,
        ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
            Box::pin(async move {
                if self.hang {
                    std::future::pending::<()>().await;
                }
                progress(chunk.data.len() as u64);
                self.received
                    .lock()
                    .unwrap()
                    .push((chunk.index, chunk.data.to_vec()));
                match &self.fail_with {
                    Some(e) => Err(e.clone()),
                    None => Ok(()),
                }
            })
        }

        fn finalize(
            &self,
            _session_key: String,
            _request: FinalizeRequest,
        ) -> Pin<Box<dyn Future<Output = Result<FinalizeResponse, TransportError>> + Send + '_>>
        {
            Box::pin(async { Ok(FinalizeResponse::default()) })
        }
    }

    fn task_for(path: PathBuf, data: &[u8], offset: u64, len: u64, digest: Option<String>) -> ChunkTask {
        let slice = &data[offset as usize..(offset + len) as usize];
        ChunkTask {
            job_id: JobId::new(),
            session_key: "key".into(),
            path,
            chunk: ChunkDescriptor {
                index: 1,
                offset,
                length: len,
                digest: digest.unwrap_or_else(|| checksum_bytes(slice)),
            },
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    fn write_file(dir: &tempfile::TempDir, data: &[u8]) -> PathBuf {
        let path = dir.path().join("paper.txt");
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn attempt_sends_exact_span() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"0123456789abcdef";
        let path = write_file(&dir, data);
        let task = task_for(path, data, 4, 8, None);
        let transport = MockTransport::default();
        let (tx, mut rx) = mpsc::channel(8);

        run_attempt(&task, &transport, Duration::from_secs(5), &tx)
            .await
            .unwrap();

        let received = transport.received.lock().unwrap();
        assert_eq!(received.as_slice(), &[(1, b"456789ab".to_vec())]);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Report::Progress { index: 1, bytes: 8, .. }
        ));
    }

    #[tokio::test]
    async fn local_digest_mismatch_never_reaches_transport() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"0123456789";
        let path = write_file(&dir, data);
        let task = task_for(path, data, 0, 5, Some(checksum_bytes(b"other")));
        let transport = MockTransport::default();
        let (tx, _rx) = mpsc::channel(8);

        let err = run_attempt(&task, &transport, Duration::from_secs(5), &tx)
            .await
            .unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::Integrity));
        assert!(transport.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"0123456789";
        let path = write_file(&dir, data);
        let task = task_for(path, data, 0, 5, None);
        task.cancel.cancel();
        let transport = MockTransport::default();
        let (tx, _rx) = mpsc::channel(8);

        let err = run_attempt(&task, &transport, Duration::from_secs(5), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Cancelled));
        assert!(transport.received.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_transport_times_out_as_transient() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"0123456789";
        let path = write_file(&dir, data);
        let task = task_for(path, data, 0, 5, None);
        let transport = MockTransport {
            hang: true,
            ..Default::default()
        };
        let (tx, _rx) = mpsc::channel(8);

        let err = run_attempt(&task, &transport, Duration::from_secs(2), &tx)
            .await
            .unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::Transient));
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"0123456789";
        let path = write_file(&dir, data);
        let task = task_for(path, data, 0, 5, None);
        let transport = MockTransport {
            hang: true,
            ..Default::default()
        };
        let (tx, _rx) = mpsc::channel(8);

        let cancel = task.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = run_attempt(&task, &transport, Duration::from_secs(30), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Cancelled));
    }

    #[tokio::test]
    async fn remote_rejection_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"0123456789";
        let path = write_file(&dir, data);
        let task = task_for(path, data, 0, 5, None);
        let transport = MockTransport {
            fail_with: Some(TransportError::status(422, "digest mismatch")),
            ..Default::default()
        };
        let (tx, _rx) = mpsc::channel(8);

        let err = run_attempt(&task, &transport, Duration::from_secs(5), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Integrity(_)));
    }

    #[tokio::test]
    async fn pool_workers_report_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"0123456789";
        let path = write_file(&dir, data);

        let (task_tx, task_rx) = mpsc::channel(4);
        let (report_tx, mut report_rx) = mpsc::channel(64);
        let pool = WorkerPool::spawn(
            2,
            task_rx,
            Arc::new(MockTransport::default()),
            Duration::from_secs(5),
            report_tx,
        );
        assert_eq!(pool.size(), 2);

        for _ in 0..3 {
            task_tx
                .send(task_for(path.clone(), data, 0, 10, None))
                .await
                .unwrap();
        }
        drop(task_tx);
        pool.join().await;

        let mut acks = 0;
        while let Ok(report) = report_rx.try_recv() {
            if matches!(report, Report::Acked { .. }) {
                acks += 1;
            }
        }
        assert_eq!(acks, 3);
    }
}
