//! Batch coordinator
//!
//! Runs many items under one bounded-concurrency gate and keeps per-batch
//! counters and results. A failed item never aborts its siblings; the
//! batch's final status is derived from the item counts once every item
//! has finished.

use crate::error::FetchError;
use crate::gate::ConcurrencyGate;
use crate::manager::{DownloadManager, DownloadOptions, ManagerCore};
use chrono::Utc;
use mediafetch_types::{
    BatchConfig, BatchJob, BatchKind, BatchProgress, BatchResult, BatchStatus, Descriptor,
    ItemStatus,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct BatchHandle {
    state: Mutex<BatchJob>,
    cancel: CancellationToken,
    /// Cancelled once the final status has been written
    done: CancellationToken,
}

impl BatchHandle {
    fn id(&self) -> String {
        self.state.lock().id.clone()
    }

    fn add_total(&self, count: usize) {
        self.state.lock().progress.total += count;
    }

    fn begin_item(&self) {
        self.state.lock().progress.in_progress += 1;
    }

    fn record(&self, result: BatchResult, was_started: bool) {
        let mut job = self.state.lock();
        if was_started {
            job.progress.in_progress = job.progress.in_progress.saturating_sub(1);
        }
        job.progress.record(result.status);
        job.results.push(result);
    }

    fn finish(&self) -> BatchJob {
        let mut job = self.state.lock();
        job.cancelled = self.cancel.is_cancelled();
        job.status = BatchStatus::from_counts(job.progress.total, job.progress.failed);
        job.completed_at = Some(Utc::now());
        job.clone()
    }
}

struct BatchInner {
    core: ManagerCore,
    batches: RwLock<HashMap<String, Arc<BatchHandle>>>,
    tasks: Mutex<JoinSet<()>>,
    root: CancellationToken,
}

/// Coordinates batch jobs on top of a [`DownloadManager`]
#[derive(Clone)]
pub struct BatchCoordinator {
    inner: Arc<BatchInner>,
}

impl BatchCoordinator {
    pub fn new(manager: &DownloadManager) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                core: manager.core(),
                batches: RwLock::new(HashMap::new()),
                tasks: Mutex::new(JoinSet::new()),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Register a batch and start processing it in the background
    pub fn start_batch(
        &self,
        kind: BatchKind,
        urls: Vec<String>,
        config: BatchConfig,
    ) -> Result<BatchJob, FetchError> {
        if self.inner.root.is_cancelled() {
            return Err(FetchError::Shutdown);
        }
        if urls.is_empty() {
            return Err(FetchError::InvalidOperation(
                "a batch needs at least one URL".to_string(),
            ));
        }

        let job = BatchJob {
            id: format!("batch_{}", Uuid::new_v4().simple()),
            kind,
            urls,
            config,
            status: BatchStatus::Pending,
            progress: BatchProgress::default(),
            results: Vec::new(),
            cancelled: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let handle = Arc::new(BatchHandle {
            state: Mutex::new(job.clone()),
            cancel: self.inner.root.child_token(),
            done: CancellationToken::new(),
        });
        self.inner
            .batches
            .write()
            .insert(job.id.clone(), handle.clone());

        let core = self.inner.core.clone();
        self.inner.tasks.lock().spawn(run_batch(core, handle));

        info!(batch_id = %job.id, inputs = job.urls.len(), "Batch created");
        Ok(job)
    }

    /// Start a batch and wait for it to finish
    pub async fn run(
        &self,
        kind: BatchKind,
        urls: Vec<String>,
        config: BatchConfig,
    ) -> Result<BatchJob, FetchError> {
        let job = self.start_batch(kind, urls, config)?;
        self.wait(&job.id).await
    }

    pub fn batch(&self, id: &str) -> Option<BatchJob> {
        self.inner
            .batches
            .read()
            .get(id)
            .map(|handle| handle.state.lock().clone())
    }

    /// Snapshots of every batch, newest first
    pub fn batches(&self) -> Vec<BatchJob> {
        let mut all: Vec<_> = self
            .inner
            .batches
            .read()
            .values()
            .map(|handle| handle.state.lock().clone())
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Stop issuing new items and abort in-flight ones
    pub fn cancel_batch(&self, id: &str) -> Result<(), FetchError> {
        let handle = self
            .inner
            .batches
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(id.to_string()))?;

        info!(batch_id = %id, "Cancelling batch");
        handle.cancel.cancel();
        Ok(())
    }

    /// Wait until a batch has its final status
    pub async fn wait(&self, id: &str) -> Result<BatchJob, FetchError> {
        let handle = self
            .inner
            .batches
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(id.to_string()))?;

        handle.done.cancelled().await;
        let snapshot = handle.state.lock().clone();
        Ok(snapshot)
    }

    /// Cancel every batch and wait for their tasks to exit
    pub async fn close(&self) {
        self.inner.root.cancel();
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Batch task ended abnormally: {}", e);
            }
        }
        debug!("Batch coordinator closed");
    }
}

async fn run_batch(core: ManagerCore, handle: Arc<BatchHandle>) {
    let (id, kind, inputs, config) = {
        let mut job = handle.state.lock();
        job.status = BatchStatus::Running;
        job.started_at = Some(Utc::now());
        (job.id.clone(), job.kind, job.urls.clone(), job.config.clone())
    };

    let items = if kind.expands() {
        expand_inputs(&core, &handle, &inputs, config.expand_limit).await
    } else {
        inputs
    };
    handle.add_total(items.len());

    let gate = ConcurrencyGate::new(config.max_concurrent);
    let mut tasks = JoinSet::new();
    let mut pending = items.into_iter();

    while let Some(url) = pending.next() {
        let permit = match gate.enter(&handle.cancel).await {
            Ok(permit) => permit,
            Err(_) => {
                handle.record(skipped(url, "batch cancelled"), false);
                for url in pending.by_ref() {
                    handle.record(skipped(url, "batch cancelled"), false);
                }
                break;
            }
        };

        handle.begin_item();
        let core = core.clone();
        let handle = handle.clone();
        let config = config.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let result = process_item(&core, &url, &config, &handle.cancel).await;
            handle.record(result, true);
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!("Batch {} item task ended abnormally: {}", id, e);
        }
    }

    let job = handle.finish();
    handle.done.cancel();
    info!(
        batch_id = %job.id,
        completed = job.progress.completed,
        failed = job.progress.failed,
        skipped = job.progress.skipped,
        "Batch finished as {}",
        job.status
    );
}

/// Expand profile/collection inputs into item URLs. An input that fails
/// to expand is recorded as one failed item.
async fn expand_inputs(
    core: &ManagerCore,
    handle: &BatchHandle,
    inputs: &[String],
    limit: usize,
) -> Vec<String> {
    let mut items = Vec::new();

    for url in inputs {
        if handle.cancel.is_cancelled() {
            handle.add_total(1);
            handle.record(skipped(url.clone(), "batch cancelled"), false);
            continue;
        }

        let started = Instant::now();
        match core.resolvers().expand(url, limit).await {
            Ok(found) => {
                info!("Batch {}: {} expanded to {} item(s)", handle.id(), url, found.len());
                items.extend(found);
            }
            Err(e) => {
                warn!(batch_id = %handle.id(), url = %url, "Failed to expand: {}", e);
                handle.add_total(1);
                handle.record(failed(url.clone(), None, &e, started), false);
            }
        }
    }

    items
}

async fn process_item(
    core: &ManagerCore,
    url: &str,
    config: &BatchConfig,
    cancel: &CancellationToken,
) -> BatchResult {
    let started = Instant::now();

    let resolved = tokio::select! {
        _ = cancel.cancelled() => return skipped(url.to_string(), "batch cancelled"),
        resolved = core.resolvers().resolve(url) => resolved,
    };
    let descriptor = match resolved {
        Ok(descriptor) => descriptor,
        Err(e) => {
            warn!("Failed to resolve {}: {}", url, e);
            return failed(url.to_string(), None, &e, started);
        }
    };

    let options = DownloadOptions {
        output_dir: Some(
            config
                .output_dir
                .clone()
                .unwrap_or_else(|| core.config().output_dir.clone()),
        ),
        format: config.format.clone(),
        ..Default::default()
    };

    if config.skip_existing {
        let path = core.destination(&descriptor, &options);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Skipping {}: {:?} already exists", url, path);
            return BatchResult {
                url: url.to_string(),
                status: ItemStatus::Skipped,
                descriptor: Some(descriptor),
                file_path: Some(path),
                size: None,
                error: None,
                duration_ms: started.elapsed().as_millis() as u64,
            };
        }
    }

    match core
        .fetch_resolved(descriptor.clone(), options, cancel, started)
        .await
    {
        Ok(outcome) => BatchResult {
            url: url.to_string(),
            status: ItemStatus::Completed,
            descriptor: Some(outcome.descriptor),
            file_path: Some(outcome.file_path),
            size: outcome.file_size,
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
        },
        Err(e) if e.is_cancelled() => BatchResult {
            descriptor: Some(descriptor),
            ..skipped(url.to_string(), "batch cancelled")
        },
        Err(e) => failed(url.to_string(), Some(descriptor), &e, started),
    }
}

fn skipped(url: String, reason: &str) -> BatchResult {
    BatchResult {
        url,
        status: ItemStatus::Skipped,
        descriptor: None,
        file_path: None,
        size: None,
        error: Some(reason.to_string()),
        duration_ms: 0,
    }
}

fn failed(
    url: String,
    descriptor: Option<Descriptor>,
    error: &FetchError,
    started: Instant,
) -> BatchResult {
    BatchResult {
        url,
        status: ItemStatus::Failed,
        descriptor,
        file_path: None,
        size: None,
        error: Some(error.to_string()),
        duration_ms: started.elapsed().as_millis() as u64,
    }
}
