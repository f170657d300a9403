//! On-disk layout and settings file handling

use crate::error::FetchError;
use directories::ProjectDirs;
use mediafetch_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

const SETTINGS_FILE: &str = "settings.json";

/// Locations derived from a data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub data_dir: PathBuf,
    /// Transfer job metadata (`<id>.json`)
    pub meta_dir: PathBuf,
    /// Partial transfer payloads (`<id>.tmp`)
    pub temp_dir: PathBuf,
    /// Per-run work directories for segmented streams
    pub segments_dir: PathBuf,
    pub database: PathBuf,
    pub settings_file: PathBuf,
}

impl Paths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            meta_dir: data_dir.join("meta"),
            temp_dir: data_dir.join("temp"),
            segments_dir: data_dir.join("segments"),
            database: data_dir.join("media.db"),
            settings_file: data_dir.join(SETTINGS_FILE),
            data_dir,
        }
    }

    /// Create every directory in the layout
    pub async fn ensure(&self) -> Result<(), FetchError> {
        for dir in [
            &self.data_dir,
            &self.meta_dir,
            &self.temp_dir,
            &self.segments_dir,
        ] {
            fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

/// Platform data directory for mediafetch, or `./.mediafetch` when the
/// platform has none
pub fn default_data_dir() -> PathBuf {
    ProjectDirs::from("", "", "mediafetch")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".mediafetch"))
}

/// Load settings from `path`, writing defaults if the file doesn't exist
pub async fn load_settings(path: &Path) -> Result<Settings, FetchError> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No settings at {:?}, writing defaults", path);
            let settings = Settings::default();
            save_settings(path, &settings).await?;
            return Ok(settings);
        }
        Err(e) => return Err(e.into()),
    };

    let settings: Settings = serde_json::from_str(&content).map_err(|e| {
        FetchError::Configuration(format!("invalid settings file {:?}: {}", path, e))
    })?;

    validate(&settings)?;
    Ok(settings)
}

pub async fn save_settings(path: &Path, settings: &Settings) -> Result<(), FetchError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

fn validate(settings: &Settings) -> Result<(), FetchError> {
    if settings.max_workers == 0 {
        return Err(FetchError::Configuration(
            "max_workers must be at least 1".to_string(),
        ));
    }
    if settings.queue_capacity == 0 {
        return Err(FetchError::Configuration(
            "queue_capacity must be at least 1".to_string(),
        ));
    }
    if settings.checkpoint_bytes == 0 {
        return Err(FetchError::Configuration(
            "checkpoint_bytes must be greater than 0".to_string(),
        ));
    }
    if !settings.file_naming.contains("{name}") && !settings.file_naming.contains("{id}") {
        warn!(
            "File naming template '{}' has neither {{name}} nor {{id}}; outputs may collide",
            settings.file_naming
        );
    }
    Ok(())
}
