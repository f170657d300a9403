//! Progress-tracking writer for transfer bodies
//!
//! Every chunk written through [`ProgressWriter`] advances the shared job
//! record and pushes a snapshot to the caller's sink without blocking. Speed
//! and ETA are recomputed at most once per second, and the job is
//! checkpointed to its metadata file every `checkpoint_bytes`.

use crate::engine::job_store::JobStore;
use crate::error::FetchError;
use chrono::Utc;
use mediafetch_types::{ProgressUpdate, TransferJob};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

/// Caller-supplied channel receiving progress snapshots
pub type ProgressSink = mpsc::Sender<ProgressUpdate>;

/// A job record shared between the engine and its writer
pub(crate) type SharedJob = Arc<Mutex<TransferJob>>;

const SPEED_WINDOW: Duration = Duration::from_secs(1);

/// Push an update to an optional sink, dropping it when the sink is full
pub(crate) fn notify(sink: Option<&ProgressSink>, update: ProgressUpdate) {
    if let Some(tx) = sink {
        let _ = tx.try_send(update);
    }
}

pub(crate) struct ProgressWriter {
    file: File,
    job: SharedJob,
    store: JobStore,
    sink: Option<ProgressSink>,
    checkpoint_bytes: u64,
    since_checkpoint: u64,
    window_start: Instant,
    window_bytes: u64,
}

impl ProgressWriter {
    pub fn new(
        file: File,
        job: SharedJob,
        store: JobStore,
        sink: Option<ProgressSink>,
        checkpoint_bytes: u64,
    ) -> Self {
        Self {
            file,
            job,
            store,
            sink,
            checkpoint_bytes: checkpoint_bytes.max(1),
            since_checkpoint: 0,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    /// Write one chunk to disk and account for it
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), FetchError> {
        self.file.write_all(chunk).await?;

        let len = chunk.len() as u64;
        self.since_checkpoint += len;
        self.window_bytes += len;

        let update = {
            let mut job = self.job.lock();
            job.downloaded += len;
            job.progress = job.percent();
            job.updated_at = Utc::now();

            let elapsed = self.window_start.elapsed();
            if elapsed >= SPEED_WINDOW {
                job.speed = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
                job.eta_secs = match job.file_size {
                    Some(total) if job.speed > 0 => {
                        Some(total.saturating_sub(job.downloaded) / job.speed)
                    }
                    _ => None,
                };
                self.window_start = Instant::now();
                self.window_bytes = 0;
            }

            job.progress_update()
        };
        notify(self.sink.as_ref(), update);

        if self.since_checkpoint >= self.checkpoint_bytes {
            self.checkpoint().await;
        }

        Ok(())
    }

    /// Persist the current job record; failures are logged and tolerated
    pub async fn checkpoint(&mut self) {
        let snapshot = self.job.lock().clone();
        if let Err(e) = self.store.save(&snapshot).await {
            warn!("Failed to checkpoint job {}: {}", snapshot.id, e);
        }
        self.since_checkpoint = 0;
    }

    /// Flush written bytes to disk and record a final checkpoint
    pub async fn finish(mut self) -> Result<(), FetchError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        self.checkpoint().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediafetch_types::TransferStatus;
    use tempfile::tempdir;

    async fn writer_fixture(
        dir: &std::path::Path,
        checkpoint_bytes: u64,
    ) -> (ProgressWriter, SharedJob, mpsc::Receiver<ProgressUpdate>) {
        let store = JobStore::new(dir.join("meta")).await.unwrap();
        let mut job = TransferJob::new(
            "job".into(),
            "http://example.com/file".into(),
            dir.join("file.bin"),
            dir.join("job.tmp"),
            store.meta_path("job"),
        );
        job.status = TransferStatus::Downloading;
        job.file_size = Some(4000);
        let job = Arc::new(Mutex::new(job));
        let file = File::create(dir.join("job.tmp")).await.unwrap();
        let (tx, rx) = mpsc::channel(16);
        let writer = ProgressWriter::new(file, job.clone(), store, Some(tx), checkpoint_bytes);
        (writer, job, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn speed_and_eta_follow_the_one_second_window() {
        let dir = tempdir().unwrap();
        let (mut writer, job, mut rx) = writer_fixture(dir.path(), u64::MAX).await;

        writer.write_chunk(&[0u8; 1000]).await.unwrap();
        assert_eq!(job.lock().speed, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        writer.write_chunk(&[0u8; 1000]).await.unwrap();

        let snapshot = job.lock().clone();
        assert_eq!(snapshot.downloaded, 2000);
        assert_eq!(snapshot.speed, 1000);
        assert_eq!(snapshot.eta_secs, Some(2));
        assert!((snapshot.progress - 50.0).abs() < f64::EPSILON);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.downloaded, 1000);
        assert_eq!(second.downloaded, 2000);
    }

    #[tokio::test]
    async fn checkpoints_are_written_every_interval() {
        let dir = tempdir().unwrap();
        let (mut writer, job, _rx) = writer_fixture(dir.path(), 1500).await;
        let meta_path = job.lock().meta_path.clone();

        writer.write_chunk(&[1u8; 1000]).await.unwrap();
        assert!(!meta_path.exists());

        writer.write_chunk(&[1u8; 1000]).await.unwrap();
        let saved: TransferJob =
            serde_json::from_slice(&tokio::fs::read(&meta_path).await.unwrap()).unwrap();
        assert_eq!(saved.downloaded, 2000);

        writer.finish().await.unwrap();
        let on_disk = tokio::fs::metadata(dir.path().join("job.tmp")).await.unwrap();
        assert_eq!(on_disk.len(), 2000);
    }

    #[tokio::test]
    async fn a_full_sink_never_blocks_the_writer() {
        let dir = tempdir().unwrap();
        let (mut writer, job, _rx) = writer_fixture(dir.path(), u64::MAX).await;

        for _ in 0..64 {
            writer.write_chunk(&[0u8; 10]).await.unwrap();
        }
        assert_eq!(job.lock().downloaded, 640);
    }
}
