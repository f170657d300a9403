//! Metadata files for in-flight transfer jobs
//!
//! Each incomplete job is checkpointed as `<meta_dir>/<id>.json`. The file is
//! written to a sibling `.json.tmp` and renamed, so a crash mid-write leaves
//! the previous checkpoint intact.

use crate::error::FetchError;
use mediafetch_types::TransferJob;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

/// Deterministic job id for a `(url, destination)` pair
pub fn job_id(url: &str, dest: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b":");
    hasher.update(dest.to_string_lossy().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// JSON checkpoint storage for transfer jobs
#[derive(Clone, Debug)]
pub struct JobStore {
    meta_dir: PathBuf,
}

impl JobStore {
    /// Create a new job store, creating the directory if needed
    pub async fn new(meta_dir: PathBuf) -> Result<Self, FetchError> {
        fs::create_dir_all(&meta_dir).await?;
        Ok(Self { meta_dir })
    }

    pub fn meta_path(&self, id: &str) -> PathBuf {
        self.meta_dir.join(format!("{}.json", id))
    }

    /// Load every readable job checkpoint. Unreadable files are skipped.
    pub async fn load_all(&self) -> Result<Vec<TransferJob>, FetchError> {
        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(&self.meta_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match fs::read_to_string(&path).await {
                    Ok(content) => match serde_json::from_str::<TransferJob>(&content) {
                        Ok(job) => jobs.push(job),
                        Err(e) => warn!("Skipping corrupt job metadata {:?}: {}", path, e),
                    },
                    Err(e) => warn!("Failed to read job metadata {:?}: {}", path, e),
                }
            }
        }

        Ok(jobs)
    }

    /// Write a checkpoint for a job
    pub async fn save(&self, job: &TransferJob) -> Result<(), FetchError> {
        let content = serde_json::to_vec_pretty(job)?;
        let staging = job.meta_path.with_extension("json.tmp");

        fs::write(&staging, content).await?;
        fs::rename(&staging, &job.meta_path).await?;

        Ok(())
    }

    /// Remove a job's checkpoint, ignoring a missing file
    pub async fn remove(&self, job: &TransferJob) -> Result<(), FetchError> {
        match fs::remove_file(&job.meta_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
