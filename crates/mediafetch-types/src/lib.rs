//! Shared types for MediaFetch
//!
//! This crate contains the serializable data model shared by the core
//! engine and the command-line front end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ============================================================================
// Transfer Types
// ============================================================================

/// A single resumable transfer of one URL to one destination path.
///
/// This is the record persisted as `<meta_dir>/<id>.json` while the
/// transfer is incomplete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferJob {
    pub id: String,
    pub url: String,
    pub file_path: PathBuf,
    pub temp_path: PathBuf,
    pub meta_path: PathBuf,
    /// Total size when known from a probe or a response header
    pub file_size: Option<u64>,
    pub downloaded: u64,
    pub status: TransferStatus,
    #[serde(default)]
    pub retry_count: u32,
    /// Expected SHA-256 of the finished file, hex encoded
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// The temp file failed verification; the next run refetches from zero
    #[serde(default)]
    pub discard_partial: bool,
    /// Whether the server advertised `Accept-Ranges: bytes` on the last probe
    #[serde(default)]
    pub accepts_ranges: Option<bool>,
    #[serde(default)]
    pub progress: f64,
    /// Bytes per second, recomputed at most once per second
    #[serde(default)]
    pub speed: u64,
    #[serde(default)]
    pub eta_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransferJob {
    pub fn new(
        id: String,
        url: String,
        file_path: PathBuf,
        temp_path: PathBuf,
        meta_path: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            url,
            file_path,
            temp_path,
            meta_path,
            file_size: None,
            downloaded: 0,
            status: TransferStatus::Pending,
            retry_count: 0,
            checksum: None,
            headers: BTreeMap::new(),
            last_error: None,
            discard_partial: false,
            accepts_ranges: None,
            progress: 0.0,
            speed: 0,
            eta_secs: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Percentage complete, or 0 when the total size is unknown
    pub fn percent(&self) -> f64 {
        match self.file_size {
            Some(size) if size > 0 => (self.downloaded as f64 / size as f64 * 100.0).min(100.0),
            _ => 0.0,
        }
    }

    pub fn progress_update(&self) -> ProgressUpdate {
        ProgressUpdate {
            job_id: self.id.clone(),
            status: self.status,
            downloaded: self.downloaded,
            total: self.file_size,
            progress: self.progress,
            speed: self.speed,
            eta_secs: self.eta_secs,
        }
    }
}

/// Lifecycle state of a transfer job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Initializing,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl TransferStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Transitions only move forward, with two exceptions: a paused job
    /// resumes, and an explicit restart takes a failed job back to
    /// `Initializing`.
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, Initializing | Paused | Failed)
                | (Initializing, Downloading | Completed | Paused | Failed)
                | (Downloading, Initializing | Completed | Paused | Failed)
                | (Paused, Initializing | Downloading | Failed)
                | (Failed, Initializing)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    /// States in which a transfer task may be running
    pub fn is_active(self) -> bool {
        matches!(self, TransferStatus::Initializing | TransferStatus::Downloading)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Initializing => "initializing",
            TransferStatus::Downloading => "downloading",
            TransferStatus::Paused => "paused",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Progress snapshot pushed to a caller-supplied sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub status: TransferStatus,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub progress: f64,
    pub speed: u64,
    pub eta_secs: Option<u64>,
}

// ============================================================================
// Media Types
// ============================================================================

/// Resolved metadata for one downloadable item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Stable identifier used by the store for idempotency checks
    pub id: String,
    /// URL the caller asked for
    pub source_url: String,
    /// Concrete location of the media bytes
    pub download_url: String,
    pub suggested_name: String,
    #[serde(default)]
    pub size_hint: Option<u64>,
    /// Expected SHA-256, hex encoded, when the source publishes one
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Persisted state of a media item tracked by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub descriptor: Descriptor,
    pub status: MediaStatus,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub downloaded_at: Option<DateTime<Utc>>,
}

impl MediaRecord {
    pub fn pending(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            status: MediaStatus::Pending,
            file_path: None,
            file_size: None,
            progress: 0.0,
            error: None,
            retry_count: 0,
            updated_at: Utc::now(),
            downloaded_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl MediaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaStatus::Pending => "pending",
            MediaStatus::Downloading => "downloading",
            MediaStatus::Completed => "completed",
            MediaStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MediaStatus::Pending),
            "downloading" => Some(MediaStatus::Downloading),
            "completed" => Some(MediaStatus::Completed),
            "failed" => Some(MediaStatus::Failed),
            _ => None,
        }
    }
}

/// Result of a single manager-level download request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub descriptor: Descriptor,
    /// Transfer job id, absent when served from the store
    pub job_id: Option<String>,
    pub file_path: PathBuf,
    pub file_size: Option<u64>,
    /// True when no transfer happened because the store already had it
    pub cached: bool,
    /// False when the final store write failed after a successful transfer
    pub persisted: bool,
    pub elapsed_ms: u64,
}

// ============================================================================
// Batch Types
// ============================================================================

/// How the inputs of a batch are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    /// Each input is one media URL
    UrlList,
    /// Each input is a profile page expanded into its media URLs
    Profile,
    /// Each input is a playlist/collection expanded into its media URLs
    Collection,
}

impl BatchKind {
    pub fn expands(self) -> bool {
        !matches!(self, BatchKind::UrlList)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
}

impl BatchStatus {
    /// Final status from item counts.
    ///
    /// `Completed` when nothing failed, `Failed` when every item failed,
    /// `Partial` for any other mix.
    pub fn from_counts(total: usize, failed: usize) -> Self {
        if failed == 0 {
            BatchStatus::Completed
        } else if failed == total {
            BatchStatus::Failed
        } else {
            BatchStatus::Partial
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Partial
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Partial => "partial",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Completed,
    Failed,
    Skipped,
}

/// Counters for a running batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub in_progress: usize,
    pub percentage: f64,
}

impl BatchProgress {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.skipped
    }

    pub fn record(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Completed => self.completed += 1,
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::Skipped => self.skipped += 1,
        }
        self.percentage = if self.total == 0 {
            100.0
        } else {
            self.finished() as f64 / self.total as f64 * 100.0
        };
    }
}

/// Outcome of one batch item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub url: String,
    pub status: ItemStatus,
    pub descriptor: Option<Descriptor>,
    pub file_path: Option<PathBuf>,
    pub size: Option<u64>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_concurrent: usize,
    pub output_dir: Option<PathBuf>,
    /// Extension used when the descriptor does not carry one
    pub format: Option<String>,
    pub skip_existing: bool,
    /// Maximum items taken from each profile/collection
    pub expand_limit: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            output_dir: None,
            format: None,
            skip_existing: true,
            expand_limit: 100,
        }
    }
}

/// Snapshot of a batch job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub kind: BatchKind,
    pub urls: Vec<String>,
    pub config: BatchConfig,
    pub status: BatchStatus,
    pub progress: BatchProgress,
    pub results: Vec<BatchResult>,
    #[serde(default)]
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Application settings, stored as `settings.json` in the data directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub download_dir: PathBuf,
    /// Worker tasks draining the manager queue
    pub max_workers: usize,
    /// Bounded queue capacity in front of the workers
    pub queue_capacity: usize,
    /// Default concurrency for batches and segmented streams
    pub max_concurrent: usize,
    pub max_retries: u32,
    /// Base delay for linear backoff between attempts
    pub retry_delay_ms: u64,
    /// Bytes between metadata checkpoints during a transfer
    pub checkpoint_bytes: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    /// Output name template; supports `{id}`, `{name}` and `{host}`
    pub file_naming: String,
    pub default_extension: String,
    /// Treat a missing checksum as a verification failure
    pub require_checksum: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir()
                .map(|p| p.join("MediaFetch"))
                .unwrap_or_else(|| PathBuf::from("./downloads")),
            max_workers: 5,
            queue_capacity: 100,
            max_concurrent: 4,
            max_retries: 3,
            retry_delay_ms: 1000,
            checkpoint_bytes: 1024 * 1024,
            connect_timeout_secs: 30,
            request_timeout_secs: 300,
            user_agent: concat!("MediaFetch/", env!("CARGO_PKG_VERSION")).to_string(),
            file_naming: "{name}_{id}".to_string(),
            default_extension: "mp4".to_string(),
            require_checksum: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paused_jobs_can_resume_but_completed_jobs_are_final() {
        use TransferStatus::*;
        assert!(Paused.can_transition_to(Downloading));
        assert!(Paused.can_transition_to(Initializing));
        assert!(Failed.can_transition_to(Initializing));
        assert!(!Completed.can_transition_to(Downloading));
        assert!(!Completed.can_transition_to(Paused));
        assert!(!Downloading.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Downloading));
    }

    #[test]
    fn downloading_jobs_can_restart_through_initializing() {
        use TransferStatus::*;
        assert!(Downloading.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Downloading));
        assert!(!Completed.can_transition_to(Initializing));
    }

    #[test]
    fn batch_status_accounts_for_partial_failure() {
        assert_eq!(BatchStatus::from_counts(5, 0), BatchStatus::Completed);
        assert_eq!(BatchStatus::from_counts(5, 2), BatchStatus::Partial);
        assert_eq!(BatchStatus::from_counts(5, 5), BatchStatus::Failed);
        assert_eq!(BatchStatus::from_counts(0, 0), BatchStatus::Completed);
    }

    #[test]
    fn batch_progress_counts_skipped_items_as_finished() {
        let mut progress = BatchProgress {
            total: 4,
            ..Default::default()
        };
        progress.record(ItemStatus::Completed);
        progress.record(ItemStatus::Skipped);
        assert_eq!(progress.finished(), 2);
        assert!((progress.percentage - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn settings_fill_missing_fields_with_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"max_workers": 2}"#).unwrap();
        assert_eq!(settings.max_workers, 2);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.checkpoint_bytes, 1024 * 1024);
    }

    #[test]
    fn percent_is_zero_without_a_known_size() {
        let mut job = TransferJob::new(
            "abc".into(),
            "http://example.com/a".into(),
            "a".into(),
            "a.tmp".into(),
            "a.json".into(),
        );
        job.downloaded = 10;
        assert_eq!(job.percent(), 0.0);
        job.file_size = Some(40);
        assert!((job.percent() - 25.0).abs() < f64::EPSILON);
    }
}
