//! Download Manager - worker pool in front of the transfer engine
//!
//! Requests go through a bounded queue drained by a fixed set of workers.
//! Each request is checked against the media store, resolved, and handed
//! to the [`TransferEngine`]; outcomes are recorded back in the store.

use crate::engine::{ProgressSink, TransferEngine, TransferRequest};
use crate::error::FetchError;
use crate::gate::ConcurrencyGate;
use crate::naming;
use crate::resolver::ResolverRegistry;
use crate::store::MediaStore;
use chrono::Utc;
use mediafetch_types::{
    Descriptor, DownloadOutcome, MediaRecord, MediaStatus, ProgressUpdate, Settings,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for the download manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub output_dir: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Gate width for [`DownloadManager::download_batch`]
    pub batch_concurrency: usize,
    pub file_naming: String,
    pub default_extension: String,
}

impl ManagerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            output_dir: settings.download_dir.clone(),
            workers: settings.max_workers.max(1),
            queue_capacity: settings.queue_capacity.max(1),
            batch_concurrency: settings.max_concurrent.max(1),
            file_naming: settings.file_naming.clone(),
            default_extension: settings.default_extension.clone(),
        }
    }
}

/// Per-request options
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub output_dir: Option<PathBuf>,
    /// Exact file name, bypassing the naming template
    pub file_name: Option<String>,
    /// Extension used when the descriptor does not carry one
    pub format: Option<String>,
    /// Extra request headers; these win over resolver-supplied headers
    pub headers: BTreeMap<String, String>,
    /// Expected SHA-256, overriding the descriptor's
    pub checksum: Option<String>,
    pub progress: Option<ProgressSink>,
}

/// Snapshot of the manager's load
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub running: bool,
    pub workers: usize,
    pub queued: usize,
    pub queue_capacity: usize,
    pub active_transfers: usize,
}

enum Target {
    Url(String),
    Resolved(Descriptor),
}

struct DownloadRequest {
    target: Target,
    options: DownloadOptions,
    reply: oneshot::Sender<Result<DownloadOutcome, FetchError>>,
}

/// Shared request pipeline used by the workers and the batch coordinator
#[derive(Clone)]
pub(crate) struct ManagerCore {
    engine: TransferEngine,
    resolvers: Arc<ResolverRegistry>,
    store: Arc<dyn MediaStore>,
    config: Arc<ManagerConfig>,
}

impl ManagerCore {
    pub(crate) fn resolvers(&self) -> &ResolverRegistry {
        &self.resolvers
    }

    pub(crate) fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Check the store, resolve, then transfer
    async fn process(
        &self,
        target: Target,
        options: DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, FetchError> {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let descriptor = match target {
            Target::Resolved(descriptor) => descriptor,
            Target::Url(url) => {
                match self.store.find_by_url(&url).await {
                    Ok(Some(record)) if record.status == MediaStatus::Completed => {
                        info!("{} already downloaded, serving from store", url);
                        return Ok(cached_outcome(record, started));
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Store lookup for {} failed: {}", url, e),
                }
                self.resolvers.resolve(&url).await?
            }
        };

        self.fetch_resolved(descriptor, options, cancel, started).await
    }

    /// Transfer an already-resolved descriptor and record the outcome
    pub(crate) async fn fetch_resolved(
        &self,
        descriptor: Descriptor,
        options: DownloadOptions,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<DownloadOutcome, FetchError> {
        let completed = match self.store.is_completed(&descriptor.id).await {
            Ok(completed) => completed,
            Err(e) => {
                warn!("Completion check for media {} failed: {}", descriptor.id, e);
                false
            }
        };
        let existing = match self.store.load(&descriptor.id).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!("Store lookup for media {} failed: {}", descriptor.id, e);
                None
            }
        };

        if let Some(record) = existing.as_ref().filter(|_| completed) {
            info!("Media {} already downloaded, serving from store", descriptor.id);
            return Ok(cached_outcome(record.clone(), started));
        }

        let dest = self.destination(&descriptor, &options);
        let mut record = MediaRecord::pending(descriptor.clone());
        record.status = MediaStatus::Downloading;
        record.file_path = Some(dest.clone());
        record.retry_count = existing.map(|r| r.retry_count).unwrap_or_default();
        self.save(&record).await;

        let mut headers = descriptor.headers.clone();
        headers.extend(options.headers.clone());

        let (sink, forwarder) = self.progress_forwarder(&descriptor.id, options.progress.clone());
        let request = TransferRequest {
            url: descriptor.download_url.clone(),
            dest: dest.clone(),
            headers,
            checksum: options.checksum.clone().or_else(|| descriptor.checksum.clone()),
            progress: Some(sink),
        };

        let result = self.engine.start_download(request, cancel).await;
        if forwarder.await.is_err() {
            debug!("Progress forwarder for media {} ended abnormally", descriptor.id);
        }

        record.updated_at = Utc::now();
        match result {
            Ok(job) => {
                record.status = MediaStatus::Completed;
                record.file_size = Some(job.downloaded);
                record.progress = 100.0;
                record.error = None;
                record.downloaded_at = job.completed_at.or_else(|| Some(Utc::now()));
                let persisted = self.save(&record).await;

                Ok(DownloadOutcome {
                    descriptor,
                    job_id: Some(job.id),
                    file_path: dest,
                    file_size: Some(job.downloaded),
                    cached: false,
                    persisted,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(e) if e.is_cancelled() => {
                record.status = MediaStatus::Pending;
                self.save(&record).await;
                Err(e)
            }
            Err(e) => {
                record.status = MediaStatus::Failed;
                record.error = Some(e.to_string());
                record.retry_count += 1;
                self.save(&record).await;
                Err(e)
            }
        }
    }

    pub(crate) fn destination(&self, descriptor: &Descriptor, options: &DownloadOptions) -> PathBuf {
        let dir = options
            .output_dir
            .clone()
            .unwrap_or_else(|| self.config.output_dir.clone());

        match options.file_name.as_deref() {
            Some(name) => dir.join(naming::sanitize_filename(name)),
            None => naming::output_path(
                &dir,
                descriptor,
                &self.config.file_naming,
                options.format.as_deref(),
                &self.config.default_extension,
            ),
        }
    }

    /// Save a record, logging failures. Returns whether the write succeeded.
    async fn save(&self, record: &MediaRecord) -> bool {
        match self.store.save_state(&record.descriptor.id, record).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to record media {}: {}", record.descriptor.id, e);
                false
            }
        }
    }

    /// Mirror engine progress into the store and an optional caller sink.
    /// Store writes happen on whole-percent changes.
    fn progress_forwarder(
        &self,
        id: &str,
        relay: Option<ProgressSink>,
    ) -> (ProgressSink, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ProgressUpdate>(64);
        let store = self.store.clone();
        let id = id.to_string();

        let handle = tokio::spawn(async move {
            let mut last_recorded = f64::NEG_INFINITY;
            while let Some(update) = rx.recv().await {
                if let Some(relay) = relay.as_ref() {
                    let _ = relay.try_send(update.clone());
                }
                if update.progress - last_recorded >= 1.0 || update.status.is_terminal() {
                    last_recorded = update.progress;
                    if let Err(e) = store.update_progress(&id, update.progress).await {
                        debug!("Progress write for media {} failed: {}", id, e);
                    }
                }
            }
        });

        (tx, handle)
    }
}

fn cached_outcome(record: MediaRecord, started: Instant) -> DownloadOutcome {
    DownloadOutcome {
        file_path: record.file_path.unwrap_or_default(),
        file_size: record.file_size,
        descriptor: record.descriptor,
        job_id: None,
        cached: true,
        persisted: true,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

/// Enqueues requests and waits for their replies
#[derive(Clone)]
struct Submitter {
    queue_tx: mpsc::Sender<DownloadRequest>,
    cancel: CancellationToken,
}

impl Submitter {
    async fn submit(
        &self,
        target: Target,
        options: DownloadOptions,
    ) -> Result<DownloadOutcome, FetchError> {
        let (reply, rx) = oneshot::channel();
        let request = DownloadRequest {
            target,
            options,
            reply,
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(FetchError::Shutdown),
            sent = self.queue_tx.send(request) => sent.map_err(|_| FetchError::Shutdown)?,
        }

        // Workers answer every request they take, and stop() fails the rest
        rx.await.map_err(|_| FetchError::Shutdown)?
    }
}

/// Download manager that feeds a fixed pool of workers
pub struct DownloadManager {
    core: ManagerCore,
    queue_tx: mpsc::Sender<DownloadRequest>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<DownloadRequest>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl DownloadManager {
    /// Create a stopped manager; call [`start`](Self::start) to spawn workers
    pub fn new(
        engine: TransferEngine,
        resolvers: Arc<ResolverRegistry>,
        store: Arc<dyn MediaStore>,
        config: ManagerConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        Self {
            core: ManagerCore {
                engine,
                resolvers,
                store,
                config: Arc::new(config),
            },
            queue_tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            workers: Mutex::new(Vec::new()),
            cancel: Mutex::new(cancel),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn core(&self) -> ManagerCore {
        self.core.clone()
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.core.engine
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the worker pool. Starting a running manager is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        let mut workers = self.workers.lock();
        for index in 0..self.core.config.workers {
            let core = self.core.clone();
            let queue_rx = self.queue_rx.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(worker_loop(index, core, queue_rx, cancel)));
        }

        info!("Download manager started with {} workers", self.core.config.workers);
    }

    /// Cancel in-flight work, wait for every worker to exit, and fail
    /// anything still queued
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.cancel.lock().cancel();

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Download worker ended abnormally: {}", e);
            }
        }

        let mut queue_rx = self.queue_rx.lock().await;
        let mut dropped = 0;
        while let Ok(request) = queue_rx.try_recv() {
            let _ = request.reply.send(Err(FetchError::Shutdown));
            dropped += 1;
        }

        info!("Download manager stopped ({} queued request(s) dropped)", dropped);
    }

    fn submitter(&self) -> Result<Submitter, FetchError> {
        if !self.is_running() {
            return Err(FetchError::Shutdown);
        }
        Ok(Submitter {
            queue_tx: self.queue_tx.clone(),
            cancel: self.cancel.lock().clone(),
        })
    }

    /// Download one URL through the worker pool
    pub async fn download(
        &self,
        url: &str,
        options: DownloadOptions,
    ) -> Result<DownloadOutcome, FetchError> {
        self.submitter()?
            .submit(Target::Url(url.to_string()), options)
            .await
    }

    /// Download many URLs, at most `batch_concurrency` in flight. Results
    /// are returned in input order; one failure never hides the others.
    pub async fn download_batch(
        &self,
        urls: Vec<String>,
        options: DownloadOptions,
    ) -> Vec<Result<DownloadOutcome, FetchError>> {
        let submitter = match self.submitter() {
            Ok(submitter) => submitter,
            Err(_) => return urls.iter().map(|_| Err(FetchError::Shutdown)).collect(),
        };

        let gate = ConcurrencyGate::new(self.core.config.batch_concurrency);
        let mut results: Vec<Option<Result<DownloadOutcome, FetchError>>> =
            urls.iter().map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (index, url) in urls.into_iter().enumerate() {
            let permit = match gate.enter(&submitter.cancel).await {
                Ok(permit) => permit,
                Err(e) => {
                    results[index] = Some(Err(e));
                    continue;
                }
            };

            let submitter = submitter.clone();
            let options = options.clone();
            tasks.spawn(async move {
                let _permit = permit;
                (index, submitter.submit(Target::Url(url), options).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!("Batch download task ended abnormally: {}", e),
            }
        }

        results
            .into_iter()
            .map(|result| result.unwrap_or(Err(FetchError::Shutdown)))
            .collect()
    }

    /// Re-enqueue a media item whose last attempt failed
    pub async fn retry(
        &self,
        media_id: &str,
        options: DownloadOptions,
    ) -> Result<DownloadOutcome, FetchError> {
        let record = self
            .core
            .store
            .load(media_id)
            .await?
            .ok_or_else(|| FetchError::NotFound(media_id.to_string()))?;

        if record.status != MediaStatus::Failed {
            return Err(FetchError::InvalidOperation(format!(
                "media {} is {}, only failed items can be retried",
                media_id,
                record.status.as_str()
            )));
        }

        info!(
            media_id = %media_id,
            attempt = record.retry_count + 1,
            "Retrying failed media"
        );
        self.submitter()?
            .submit(Target::Resolved(record.descriptor), options)
            .await
    }

    pub async fn status(&self) -> ManagerStatus {
        let queue_capacity = self.core.config.queue_capacity.max(1);
        ManagerStatus {
            running: self.is_running(),
            workers: if self.is_running() {
                self.core.config.workers
            } else {
                0
            },
            queued: queue_capacity.saturating_sub(self.queue_tx.capacity()),
            queue_capacity,
            active_transfers: self.core.engine.active_count().await,
        }
    }
}

async fn worker_loop(
    index: usize,
    core: ManagerCore,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<DownloadRequest>>>,
    cancel: CancellationToken,
) {
    debug!("Download worker {} started", index);

    loop {
        let next = {
            let mut queue_rx = queue_rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                request = queue_rx.recv() => request,
            }
        };

        let Some(request) = next else {
            break;
        };

        if cancel.is_cancelled() {
            let _ = request.reply.send(Err(FetchError::Cancelled));
            break;
        }

        let result = core.process(request.target, request.options, &cancel).await;
        let _ = request.reply.send(result);
    }

    debug!("Download worker {} stopped", index);
}
