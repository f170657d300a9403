//! Resumable transfer engine
//!
//! Drives one URL to one destination path through
//! `pending -> initializing -> downloading -> completed | failed | paused`.
//! Partial bytes live in `<temp_dir>/<id>.tmp` and the job record in
//! `<meta_dir>/<id>.json`; both survive a crash and are picked up again by
//! the next engine instance.

use crate::engine::job_store::{job_id, JobStore};
use crate::engine::progress::{notify, ProgressSink, ProgressWriter, SharedJob};
use crate::engine::verify::verify_file;
use crate::error::FetchError;
use chrono::Utc;
use futures::StreamExt;
use mediafetch_types::{Settings, TransferJob, TransferStatus};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Method, Response, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Tunables for the transfer engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub meta_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Linear backoff base: attempt `n` waits `n * retry_delay`
    pub retry_delay: Duration,
    pub checkpoint_bytes: u64,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
    pub require_checksum: bool,
}

impl EngineConfig {
    pub fn new(meta_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self::from_settings(&Settings::default(), meta_dir, temp_dir)
    }

    pub fn from_settings(
        settings: &Settings,
        meta_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            meta_dir: meta_dir.into(),
            temp_dir: temp_dir.into(),
            max_retries: settings.max_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            checkpoint_bytes: settings.checkpoint_bytes,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            user_agent: settings.user_agent.clone(),
            require_checksum: settings.require_checksum,
        }
    }
}

/// What to fetch and where to put it
#[derive(Debug, Clone, Default)]
pub struct TransferRequest {
    pub url: String,
    pub dest: PathBuf,
    pub headers: BTreeMap<String, String>,
    /// Expected SHA-256 of the finished file, hex encoded
    pub checksum: Option<String>,
    pub progress: Option<ProgressSink>,
}

impl TransferRequest {
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            ..Default::default()
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }
}

/// Handles for a transfer that is currently running
#[derive(Clone)]
struct ActiveRun {
    cancel: CancellationToken,
    /// Cancelled once the run has persisted its final state
    finished: CancellationToken,
}

struct JobEntry {
    job: SharedJob,
    active: Option<ActiveRun>,
}

impl JobEntry {
    fn idle(job: TransferJob) -> Self {
        Self {
            job: Arc::new(Mutex::new(job)),
            active: None,
        }
    }
}

enum Claim {
    Done(TransferJob),
    Run(SharedJob, ActiveRun),
    /// Another caller is running the job; holds its `finished` token
    Wait(CancellationToken),
}

struct EngineInner {
    client: Client,
    config: EngineConfig,
    store: JobStore,
    jobs: RwLock<HashMap<String, JobEntry>>,
}

/// Resumable single-stream transfer engine
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    /// Create an engine and recover jobs left behind by a previous run
    pub async fn new(config: EngineConfig) -> Result<Self, FetchError> {
        fs::create_dir_all(&config.temp_dir).await?;
        let store = JobStore::new(config.meta_dir.clone()).await?;

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        let engine = Self {
            inner: Arc::new(EngineInner {
                client,
                config,
                store,
                jobs: RwLock::new(HashMap::new()),
            }),
        };

        let recovered = engine.recover().await?;
        if recovered > 0 {
            info!("Recovered {} incomplete transfer(s)", recovered);
        }

        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Load job checkpoints from disk. Jobs that were mid-transfer when the
    /// previous process died are marked paused; nothing touches the network.
    async fn recover(&self) -> Result<usize, FetchError> {
        let jobs = self.inner.store.load_all().await?;
        let count = jobs.len();
        let mut registry = self.inner.jobs.write().await;

        for mut job in jobs {
            if let Ok(meta) = fs::metadata(&job.temp_path).await {
                job.downloaded = meta.len();
                job.progress = job.percent();
            }
            job.speed = 0;
            job.eta_secs = None;

            if job.status.is_active() || job.status == TransferStatus::Pending {
                info!(
                    "Job {} was {} when last seen, marking paused",
                    job.id, job.status
                );
                job.status = TransferStatus::Paused;
                job.updated_at = Utc::now();
                if let Err(e) = self.inner.store.save(&job).await {
                    warn!("Failed to persist recovered job {}: {}", job.id, e);
                }
            }

            registry.insert(job.id.clone(), JobEntry::idle(job));
        }

        Ok(count)
    }

    // ========================================================================
    // Job Operations
    // ========================================================================

    /// Start (or continue) the transfer of `request.url` to `request.dest`.
    ///
    /// The job id is derived from the URL and destination, so calling this
    /// twice for the same pair resumes the same job. A job that already
    /// completed in this process is returned without network I/O. While
    /// another caller runs the job, this waits for that run to end and then
    /// takes over whatever state it left.
    pub async fn start_download(
        &self,
        mut request: TransferRequest,
        parent: &CancellationToken,
    ) -> Result<TransferJob, FetchError> {
        validate_url(&request.url)?;
        if request.dest.file_name().is_none() {
            return Err(FetchError::Configuration(format!(
                "destination {:?} has no file name",
                request.dest
            )));
        }

        let id = job_id(&request.url, &request.dest);
        loop {
            let claim = {
                let mut jobs = self.inner.jobs.write().await;
                let entry = jobs
                    .entry(id.clone())
                    .or_insert_with(|| JobEntry::idle(self.new_job(&id, &request)));

                {
                    let mut job = entry.job.lock();
                    if !request.headers.is_empty() {
                        job.headers = request.headers.clone();
                    }
                    if request.checksum.is_some() {
                        job.checksum = request.checksum.clone();
                    }
                }

                Self::claim(entry, parent)
            };

            match claim {
                Claim::Wait(finished) => {
                    Self::wait_for_run(&id, &request.url, &finished, parent).await?
                }
                Claim::Done(job) => return Ok(job),
                Claim::Run(job, run) => {
                    return self.run_claim(&id, job, run, request.progress.take()).await
                }
            }
        }
    }

    /// Resume a paused, failed, or recovered job by id
    pub async fn resume_download(
        &self,
        id: &str,
        progress: Option<ProgressSink>,
        parent: &CancellationToken,
    ) -> Result<TransferJob, FetchError> {
        let mut progress = progress;
        loop {
            let (claim, url) = {
                let mut jobs = self.inner.jobs.write().await;
                let entry = jobs
                    .get_mut(id)
                    .ok_or_else(|| FetchError::NotFound(id.to_string()))?;
                let url = entry.job.lock().url.clone();
                (Self::claim(entry, parent), url)
            };

            match claim {
                Claim::Wait(finished) => Self::wait_for_run(id, &url, &finished, parent).await?,
                Claim::Done(job) => return Ok(job),
                Claim::Run(job, run) => return self.run_claim(id, job, run, progress.take()).await,
            }
        }
    }

    /// Pause a job. An active transfer is cancelled and this waits until
    /// its paused state has been persisted.
    pub async fn pause_job(&self, id: &str) -> Result<TransferJob, FetchError> {
        let (job, active) = {
            let jobs = self.inner.jobs.read().await;
            let entry = jobs
                .get(id)
                .ok_or_else(|| FetchError::NotFound(id.to_string()))?;
            (entry.job.clone(), entry.active.clone())
        };

        match active {
            Some(run) => {
                info!(job_id = %id, "Pausing job");
                run.cancel.cancel();
                run.finished.cancelled().await;
            }
            None => {
                if transition(&job, TransferStatus::Paused) {
                    self.persist(&job).await;
                }
            }
        }

        let snapshot = job.lock().clone();
        Ok(snapshot)
    }

    /// Cancel a job if running and remove its temp file and metadata
    pub async fn delete_job(&self, id: &str) -> Result<(), FetchError> {
        let entry = self
            .inner
            .jobs
            .write()
            .await
            .remove(id)
            .ok_or_else(|| FetchError::NotFound(id.to_string()))?;

        if let Some(run) = entry.active {
            run.cancel.cancel();
            run.finished.cancelled().await;
        }

        let job = entry.job.lock().clone();
        remove_if_exists(&job.temp_path).await?;
        self.inner.store.remove(&job).await?;

        info!(job_id = %id, "Deleted job");
        Ok(())
    }

    /// Snapshot of one job
    pub async fn job(&self, id: &str) -> Option<TransferJob> {
        let jobs = self.inner.jobs.read().await;
        jobs.get(id).map(|entry| entry.job.lock().clone())
    }

    /// Snapshots of every known job, oldest first
    pub async fn jobs(&self) -> Vec<TransferJob> {
        let jobs = self.inner.jobs.read().await;
        let mut all: Vec<_> = jobs.values().map(|entry| entry.job.lock().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Number of transfers currently running
    pub async fn active_count(&self) -> usize {
        let jobs = self.inner.jobs.read().await;
        jobs.values().filter(|entry| entry.active.is_some()).count()
    }

    // ========================================================================
    // Transfer Internals
    // ========================================================================

    fn new_job(&self, id: &str, request: &TransferRequest) -> TransferJob {
        let mut job = TransferJob::new(
            id.to_string(),
            request.url.clone(),
            request.dest.clone(),
            self.inner.config.temp_dir.join(format!("{}.tmp", id)),
            self.inner.store.meta_path(id),
        );
        job.headers = request.headers.clone();
        job.checksum = request.checksum.clone();
        job
    }

    fn claim(entry: &mut JobEntry, parent: &CancellationToken) -> Claim {
        if let Some(run) = entry.active.as_ref() {
            return Claim::Wait(run.finished.clone());
        }

        {
            let job = entry.job.lock();
            if job.status == TransferStatus::Completed {
                debug!(job_id = %job.id, "Job already completed");
                return Claim::Done(job.clone());
            }
        }

        let run = ActiveRun {
            cancel: parent.child_token(),
            finished: CancellationToken::new(),
        };
        entry.active = Some(run.clone());
        Claim::Run(entry.job.clone(), run)
    }

    /// Wait for another caller's run of the job to end
    async fn wait_for_run(
        id: &str,
        url: &str,
        finished: &CancellationToken,
        parent: &CancellationToken,
    ) -> Result<(), FetchError> {
        debug!(job_id = %id, "Job is running elsewhere, waiting for it");
        tokio::select! {
            _ = parent.cancelled() => Err(FetchError::Cancelled.in_transfer(id, url, 0)),
            _ = finished.cancelled() => Ok(()),
        }
    }

    async fn run_claim(
        &self,
        id: &str,
        job: SharedJob,
        run: ActiveRun,
        sink: Option<ProgressSink>,
    ) -> Result<TransferJob, FetchError> {
        let result = self.drive(&job, sink.as_ref(), &run.cancel).await;

        if let Some(entry) = self.inner.jobs.write().await.get_mut(id) {
            entry.active = None;
        }
        run.finished.cancel();

        result
    }

    /// Run a claimed job to a terminal or paused state and record the outcome
    async fn drive(
        &self,
        job: &SharedJob,
        sink: Option<&ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<TransferJob, FetchError> {
        let (id, url) = {
            let job = job.lock();
            (job.id.clone(), job.url.clone())
        };

        let mut attempts = 0;
        match self.execute(job, sink, cancel, &mut attempts).await {
            Ok(()) => {
                let snapshot = job.lock().clone();
                Ok(snapshot)
            }
            Err(e) if e.is_cancelled() => {
                transition(job, TransferStatus::Paused);
                self.persist(job).await;
                notify(sink, job.lock().progress_update());
                let downloaded = job.lock().downloaded;
                info!(job_id = %id, downloaded, "Job paused");
                Err(e.in_transfer(&id, &url, attempts))
            }
            Err(e) => {
                {
                    let mut job = job.lock();
                    job.last_error = Some(e.to_string());
                    job.discard_partial = e.is_verification();
                    job.speed = 0;
                }
                transition(job, TransferStatus::Failed);
                self.persist(job).await;
                notify(sink, job.lock().progress_update());
                error!(job_id = %id, url = %url, attempts, "Job failed: {}", e);
                Err(e.in_transfer(&id, &url, attempts))
            }
        }
    }

    async fn execute(
        &self,
        job: &SharedJob,
        sink: Option<&ProgressSink>,
        cancel: &CancellationToken,
        attempts: &mut u32,
    ) -> Result<(), FetchError> {
        let config = &self.inner.config;

        transition(job, TransferStatus::Initializing);
        self.persist(job).await;
        notify(sink, job.lock().progress_update());

        self.probe(job, cancel).await?;

        if self.already_present(job).await {
            return self.complete(job, sink, None).await;
        }

        let mut restart = false;
        loop {
            *attempts += 1;
            let offset = self.resume_offset(job, std::mem::take(&mut restart)).await?;
            if transition(job, TransferStatus::Downloading) {
                self.persist(job).await;
                notify(sink, job.lock().progress_update());
            }

            match self.fetch(job, sink, cancel, offset).await {
                Ok(()) => break,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if !e.is_retryable() || *attempts > config.max_retries => return Err(e),
                Err(e) => {
                    if matches!(e, FetchError::ProtocolMismatch { .. }) {
                        // Progress drops back to zero, so leave the downloading state
                        restart = true;
                        if transition(job, TransferStatus::Initializing) {
                            notify(sink, job.lock().progress_update());
                        }
                    }

                    let delay = config.retry_delay * *attempts;
                    let id = {
                        let mut job = job.lock();
                        job.retry_count += 1;
                        job.last_error = Some(e.to_string());
                        job.id.clone()
                    };
                    warn!(
                        job_id = %id,
                        attempt = *attempts,
                        "Attempt failed: {}; retrying in {:?}",
                        e,
                        delay
                    );
                    self.persist(job).await;

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let temp_path = job.lock().temp_path.clone();
        self.complete(job, sink, Some(&temp_path)).await
    }

    /// HEAD the URL for size and range support. Only cancellation is
    /// fatal here; servers that reject HEAD are fetched without a size.
    async fn probe(&self, job: &SharedJob, cancel: &CancellationToken) -> Result<(), FetchError> {
        let (id, url, headers) = {
            let job = job.lock();
            (job.id.clone(), job.url.clone(), job.headers.clone())
        };

        let request = self.request(Method::HEAD, &url, &headers);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = request.send() => response,
        };

        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(
                    "Probe of {} returned {}; continuing without size information",
                    url,
                    response.status()
                );
                return Ok(());
            }
            Err(e) => {
                warn!("Probe of {} failed: {}; continuing", url, e);
                return Ok(());
            }
        };

        let size = header_u64(response.headers(), CONTENT_LENGTH).filter(|size| *size > 0);
        let accepts_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        let stale_temp = {
            let mut job = job.lock();
            let stale = matches!((job.file_size, size), (Some(old), Some(new)) if old != new);
            if size.is_some() {
                job.file_size = size;
            }
            job.accepts_ranges = Some(accepts_ranges);
            stale.then(|| job.temp_path.clone())
        };

        if let Some(temp_path) = stale_temp {
            warn!("Remote size of job {} changed, discarding partial data", id);
            remove_if_exists(&temp_path).await?;
            job.lock().downloaded = 0;
        }

        if !accepts_ranges {
            info!(
                "Server for job {} does not advertise range support; resumes will be validated",
                id
            );
        }
        debug!("Probed job {}: size={:?}, ranges={}", id, size, accepts_ranges);

        Ok(())
    }

    /// True when the destination already holds the expected bytes
    async fn already_present(&self, job: &SharedJob) -> bool {
        let (dest, size, checksum) = {
            let job = job.lock();
            (job.file_path.clone(), job.file_size, job.checksum.clone())
        };

        let Some(size) = size else {
            return false;
        };

        match fs::metadata(&dest).await {
            Ok(meta) if meta.is_file() && meta.len() == size => {}
            _ => return false,
        }

        match checksum {
            Some(checksum) => verify_file(&dest, Some(size), Some(&checksum), false)
                .await
                .is_ok(),
            None => !self.inner.config.require_checksum,
        }
    }

    /// Size of the usable partial data in the temp file. Data that cannot
    /// be continued is truncated first. Runs before the job enters the
    /// downloading state so `downloaded` never shrinks while downloading.
    async fn resume_offset(&self, job: &SharedJob, restart: bool) -> Result<u64, FetchError> {
        let (id, temp_path, total, discard_partial) = {
            let job = job.lock();
            (
                job.id.clone(),
                job.temp_path.clone(),
                job.file_size,
                job.discard_partial,
            )
        };

        let mut offset = match fs::metadata(&temp_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let discard = restart || discard_partial || total.is_some_and(|total| offset > total);
        if offset > 0 && discard {
            warn!(job_id = %id, bytes = offset, "Discarding partial data");
            OpenOptions::new()
                .write(true)
                .open(&temp_path)
                .await?
                .set_len(0)
                .await?;
            offset = 0;
        }

        let mut job = job.lock();
        job.discard_partial = false;
        job.downloaded = offset;
        job.progress = job.percent();
        Ok(offset)
    }

    /// One attempt: fetch the bytes after `offset` into the temp file
    async fn fetch(
        &self,
        job: &SharedJob,
        sink: Option<&ProgressSink>,
        cancel: &CancellationToken,
        offset: u64,
    ) -> Result<(), FetchError> {
        let (id, url, headers, temp_path, total) = {
            let job = job.lock();
            (
                job.id.clone(),
                job.url.clone(),
                job.headers.clone(),
                job.temp_path.clone(),
                job.file_size,
            )
        };

        if total.is_some_and(|total| total > 0 && offset == total) {
            debug!("Job {} already holds all {} bytes", id, offset);
            return Ok(());
        }

        let mut request = self.request(Method::GET, &url, &headers);
        if offset > 0 {
            info!(job_id = %id, url = %url, offset, "Resuming from partial data");
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        let expected = if offset > 0 {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };

        if status != expected {
            if status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT {
                warn!(
                    "Job {} expected {} but server answered {}",
                    id, expected, status
                );
                return Err(FetchError::ProtocolMismatch {
                    expected: expected.as_u16(),
                    actual: status.as_u16(),
                });
            }
            return Err(FetchError::Status {
                status: status.as_u16(),
                url,
            });
        }

        if offset > 0 {
            if let Some(start) = content_range_start(response.headers()) {
                if start != offset {
                    warn!(
                        "Job {} asked for byte {} but server started at {}",
                        id, offset, start
                    );
                    return Err(FetchError::ProtocolMismatch {
                        expected: expected.as_u16(),
                        actual: status.as_u16(),
                    });
                }
            }
        }

        if total.is_none() {
            if let Some(discovered) = total_from_response(response.headers(), offset) {
                debug!("Job {} size discovered from response: {} bytes", id, discovered);
                job.lock().file_size = Some(discovered);
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&temp_path)
            .await?;
        let mut writer = ProgressWriter::new(
            file,
            job.clone(),
            self.inner.store.clone(),
            sink.cloned(),
            self.inner.config.checkpoint_bytes,
        );

        let streamed = stream_body(&mut writer, response, cancel).await;
        let flushed = writer.finish().await;
        streamed?;
        flushed?;

        let (received, expected_total) = {
            let job = job.lock();
            (job.downloaded, job.file_size)
        };
        if let Some(expected_total) = expected_total {
            if received < expected_total {
                return Err(FetchError::Incomplete {
                    received,
                    expected: expected_total,
                });
            }
        }

        Ok(())
    }

    /// Verify the downloaded bytes and promote them to the destination.
    /// `temp_path` is `None` when the destination was already valid.
    async fn complete(
        &self,
        job: &SharedJob,
        sink: Option<&ProgressSink>,
        temp_path: Option<&Path>,
    ) -> Result<(), FetchError> {
        let (id, dest, total, checksum) = {
            let job = job.lock();
            (
                job.id.clone(),
                job.file_path.clone(),
                job.file_size,
                job.checksum.clone(),
            )
        };

        let size = match temp_path {
            Some(temp_path) => {
                let size = verify_file(
                    temp_path,
                    total,
                    checksum.as_deref(),
                    self.inner.config.require_checksum,
                )
                .await?;
                promote(temp_path, &dest).await?;
                size
            }
            None => {
                info!("Destination {:?} already present and valid for job {}", dest, id);
                let temp_path = job.lock().temp_path.clone();
                remove_if_exists(&temp_path).await?;
                total.unwrap_or_default()
            }
        };

        let snapshot = {
            let mut job = job.lock();
            job.downloaded = size;
            job.file_size = Some(size);
            job.progress = 100.0;
            job.speed = 0;
            job.eta_secs = Some(0);
            job.last_error = None;
            job.completed_at = Some(Utc::now());
            job.updated_at = Utc::now();
            if !job.status.can_transition_to(TransferStatus::Completed) {
                warn!("Job {} completing from unexpected state {}", id, job.status);
            }
            job.status = TransferStatus::Completed;
            job.clone()
        };

        if let Err(e) = self.inner.store.remove(&snapshot).await {
            warn!("Failed to remove metadata for job {}: {}", id, e);
        }
        notify(sink, snapshot.progress_update());
        info!(job_id = %id, bytes = size, "Job completed -> {:?}", dest);

        Ok(())
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> reqwest::RequestBuilder {
        let mut request = self.inner.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    async fn persist(&self, job: &SharedJob) {
        let snapshot = job.lock().clone();
        if snapshot.status == TransferStatus::Completed {
            return;
        }
        if let Err(e) = self.inner.store.save(&snapshot).await {
            warn!("Failed to persist job {}: {}", snapshot.id, e);
        }
    }
}

async fn stream_body(
    writer: &mut ProgressWriter,
    response: Response,
    cancel: &CancellationToken,
) -> Result<(), FetchError> {
    let mut stream = response.bytes_stream();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            next = stream.next() => next,
        };

        match next {
            Some(chunk) => writer.write_chunk(&chunk?).await?,
            None => return Ok(()),
        }
    }
}

/// Apply a status change if legal, returning whether it happened
fn transition(job: &SharedJob, next: TransferStatus) -> bool {
    let mut job = job.lock();
    if job.status == next {
        return false;
    }
    if !job.status.can_transition_to(next) {
        debug!("Ignoring transition of job {} from {} to {}", job.id, job.status, next);
        return false;
    }
    job.status = next;
    job.updated_at = Utc::now();
    true
}

fn validate_url(raw: &str) -> Result<(), FetchError> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(FetchError::Configuration(format!(
            "unsupported URL scheme '{}' in {}",
            other, raw
        ))),
    }
}

fn header_u64(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Start offset of a `Content-Range: bytes <start>-<end>/<total>` header
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    range.split('-').next()?.trim().parse().ok()
}

/// Total resource size from `Content-Range`, falling back to
/// `Content-Length` plus the bytes already on disk
fn total_from_response(headers: &HeaderMap, offset: u64) -> Option<u64> {
    let from_range = headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .filter(|total| *total != "*")
        .and_then(|total| total.trim().parse().ok());

    from_range.or_else(|| header_u64(headers, CONTENT_LENGTH).map(|len| offset + len))
}

/// Move the temp file into place, copying through a staging file when a
/// plain rename is not possible
async fn promote(temp_path: &Path, dest: &Path) -> Result<(), FetchError> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    if let Err(e) = fs::rename(temp_path, dest).await {
        debug!("Rename into {:?} failed ({}), copying instead", dest, e);
        let mut staging = dest.as_os_str().to_owned();
        staging.push(".part");
        let staging = PathBuf::from(staging);
        fs::copy(temp_path, &staging).await?;
        fs::rename(&staging, dest).await?;
        fs::remove_file(temp_path).await?;
    }

    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), FetchError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn content_range_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 4194304-10485759/10485760"));
        assert_eq!(content_range_start(&headers), Some(4_194_304));
        assert_eq!(total_from_response(&headers, 4_194_304), Some(10_485_760));
    }

    #[test]
    fn total_falls_back_to_content_length_plus_offset() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 100-199/*"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("100"));
        assert_eq!(total_from_response(&headers, 100), Some(200));
    }

    #[test]
    fn only_http_urls_are_accepted() {
        assert!(validate_url("https://example.com/a.mp4").is_ok());
        assert!(matches!(
            validate_url("ftp://example.com/a.mp4"),
            Err(FetchError::Configuration(_))
        ));
        assert!(validate_url("not a url").is_err());
    }
}
