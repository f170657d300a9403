//! Segmented stream downloads
//!
//! Fetches every segment listed in an HLS-style media playlist under a
//! bounded gate, then concatenates them in playlist order. Segments land in
//! a per-run work directory that is removed whether the run succeeds or not.
//! Any segment failure aborts the whole stream and no output is produced.

use crate::error::FetchError;
use crate::gate::ConcurrencyGate;
use futures::StreamExt;
use mediafetch_types::Settings;
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Tunables for segmented stream downloads
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Parent of the per-run segment directories
    pub work_dir: PathBuf,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
}

impl StreamConfig {
    pub fn from_settings(settings: &Settings, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            max_concurrent: settings.max_concurrent.max(1),
            max_retries: settings.max_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            user_agent: settings.user_agent.clone(),
            headers: BTreeMap::new(),
        }
    }
}

/// Segment-count progress for a running stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamProgress {
    pub completed: usize,
    pub total: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSummary {
    pub output: PathBuf,
    pub segments: usize,
    pub bytes: u64,
}

/// Segment URLs from a media playlist, resolved against `base`.
///
/// Blank lines and lines starting with `#` are ignored.
pub fn parse_playlist(body: &str, base: &Url) -> Result<Vec<Url>, FetchError> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| base.join(line).map_err(FetchError::from))
        .collect()
}

pub struct SegmentedStreamDownloader {
    client: Client,
    config: StreamConfig,
}

impl SegmentedStreamDownloader {
    pub fn new(config: StreamConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    /// Download the stream behind `playlist_url` into `output`
    pub async fn download(
        &self,
        playlist_url: &str,
        output: &Path,
        progress: Option<mpsc::Sender<StreamProgress>>,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary, FetchError> {
        let base = Url::parse(playlist_url)?;
        let body = self.fetch_playlist(&base, cancel).await?;
        let segments = parse_playlist(&body, &base)?;
        if segments.is_empty() {
            return Err(FetchError::EmptyPlaylist(playlist_url.to_string()));
        }

        info!(
            "Stream {} has {} segment(s), fetching {} at a time",
            playlist_url,
            segments.len(),
            self.config.max_concurrent
        );

        let work_dir = self
            .config
            .work_dir
            .join(format!("stream_{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&work_dir).await?;

        let result = self
            .fetch_and_merge(&segments, &work_dir, output, progress, cancel)
            .await;

        if let Err(e) = fs::remove_dir_all(&work_dir).await {
            warn!("Failed to clean up segment directory {:?}: {}", work_dir, e);
        }

        match &result {
            Ok(summary) => info!(
                "Stream {} assembled: {} segment(s), {} bytes -> {:?}",
                playlist_url, summary.segments, summary.bytes, summary.output
            ),
            Err(e) => warn!(url = %playlist_url, "Stream failed: {}", e),
        }

        result
    }

    async fn fetch_playlist(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let request = with_headers(self.client.get(url.clone()), &self.config.headers);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = request.send() => response?,
        };

        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        Ok(response.text().await?)
    }

    async fn fetch_and_merge(
        &self,
        segments: &[Url],
        work_dir: &Path,
        output: &Path,
        progress: Option<mpsc::Sender<StreamProgress>>,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary, FetchError> {
        let total = segments.len();
        let gate = ConcurrencyGate::new(self.config.max_concurrent);
        let abort = cancel.child_token();
        let completed = Arc::new(AtomicUsize::new(0));
        let bytes = Arc::new(AtomicU64::new(0));
        let mut tasks = JoinSet::new();

        for (index, url) in segments.iter().enumerate() {
            // A permit is taken before spawning so at most `max_concurrent` tasks exist
            let Ok(permit) = gate.enter(&abort).await else {
                break;
            };

            let fetcher = SegmentFetch {
                client: self.client.clone(),
                url: url.clone(),
                path: segment_path(work_dir, index),
                headers: self.config.headers.clone(),
                max_retries: self.config.max_retries,
                retry_delay: self.config.retry_delay,
            };
            let abort = abort.clone();
            let completed = completed.clone();
            let bytes = bytes.clone();
            let progress = progress.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let size = match fetcher.run(&abort).await {
                    Ok(size) => size,
                    Err(e) => {
                        abort.cancel();
                        return Err(e);
                    }
                };

                let done = completed.fetch_add(1, Ordering::AcqRel) + 1;
                let total_bytes = bytes.fetch_add(size, Ordering::AcqRel) + size;
                if let Some(tx) = progress.as_ref() {
                    let _ = tx.try_send(StreamProgress {
                        completed: done,
                        total,
                        bytes: total_bytes,
                    });
                }
                Ok::<_, FetchError>(())
            });
        }

        let mut failure: Option<FetchError> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => Err(FetchError::InvalidOperation(format!(
                    "segment task panicked: {}",
                    e
                ))),
            };

            if let Err(e) = outcome {
                abort.cancel();
                if failure.is_none() && !e.is_cancelled() {
                    warn!("Segment failed, aborting stream: {}", e);
                    tasks.abort_all();
                    failure = Some(e);
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if completed.load(Ordering::Acquire) < total {
            return Err(FetchError::Cancelled);
        }

        let written = concat_segments(work_dir, total, output).await?;
        Ok(StreamSummary {
            output: output.to_path_buf(),
            segments: total,
            bytes: written,
        })
    }
}

struct SegmentFetch {
    client: Client,
    url: Url,
    path: PathBuf,
    headers: BTreeMap<String, String>,
    max_retries: u32,
    retry_delay: Duration,
}

impl SegmentFetch {
    async fn run(&self, cancel: &CancellationToken) -> Result<u64, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(cancel).await {
                Ok(size) => return Ok(size),
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    let delay = self.retry_delay * attempt;
                    debug!(url = %self.url, attempt, "Segment attempt failed: {}; retrying", e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, cancel: &CancellationToken) -> Result<u64, FetchError> {
        let request = with_headers(self.client.get(self.url.clone()), &self.headers);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = request.send() => response?,
        };

        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: self.url.to_string(),
            });
        }

        let mut file = File::create(&self.path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(chunk) => {
                    let chunk = chunk?;
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                None => break,
            }
        }

        file.flush().await?;
        Ok(written)
    }
}

fn segment_path(work_dir: &Path, index: usize) -> PathBuf {
    work_dir.join(format!("segment_{:05}.ts", index))
}

fn with_headers(
    mut request: reqwest::RequestBuilder,
    headers: &BTreeMap<String, String>,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

/// Concatenate segments in index order into `output` via a `.part` file
async fn concat_segments(work_dir: &Path, total: usize, output: &Path) -> Result<u64, FetchError> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let mut staging = output.as_os_str().to_owned();
    staging.push(".part");
    let staging = PathBuf::from(staging);

    let assembled = async {
        let mut out = File::create(&staging).await?;
        let mut written = 0u64;
        for index in 0..total {
            let mut segment = File::open(segment_path(work_dir, index)).await?;
            written += tokio::io::copy(&mut segment, &mut out).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok::<_, FetchError>(written)
    }
    .await;

    match assembled {
        Ok(written) => {
            fs::rename(&staging, output).await?;
            Ok(written)
        }
        Err(e) => {
            let _ = fs::remove_file(&staging).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playlist_parsing_skips_tags_and_resolves_relative_uris() {
        let base = Url::parse("https://media.test/live/index.m3u8?token=1").unwrap();
        let body = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n\n#EXTINF:10,\nseg0.ts\n#EXTINF:10,\n../other/seg1.ts\n  https://cdn.test/seg2.ts  \n#EXT-X-ENDLIST\n";

        let segments = parse_playlist(body, &base).unwrap();
        let urls: Vec<_> = segments.iter().map(Url::as_str).collect();
        assert_eq!(
            urls,
            vec![
                "https://media.test/live/seg0.ts",
                "https://media.test/other/seg1.ts",
                "https://cdn.test/seg2.ts",
            ]
        );
    }

    #[test]
    fn tag_only_playlists_have_no_segments() {
        let base = Url::parse("https://media.test/index.m3u8").unwrap();
        assert!(parse_playlist("#EXTM3U\n#EXT-X-ENDLIST\n", &base)
            .unwrap()
            .is_empty());
    }
}
