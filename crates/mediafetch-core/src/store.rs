//! Media record persistence
//!
//! The download manager consults a [`MediaStore`] for idempotency and records
//! outcomes there. Store failures never abort a transfer; callers log them.

use crate::error::FetchError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mediafetch_types::{Descriptor, MediaRecord, MediaStatus};
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Whether the media item with this descriptor id finished downloading
    async fn is_completed(&self, id: &str) -> Result<bool, FetchError>;

    /// Insert or replace the record for `id`
    async fn save_state(&self, id: &str, record: &MediaRecord) -> Result<(), FetchError>;

    /// Record transfer progress (0-100) for `id`
    async fn update_progress(&self, id: &str, progress: f64) -> Result<(), FetchError>;

    async fn load(&self, id: &str) -> Result<Option<MediaRecord>, FetchError>;

    /// Most recent record whose descriptor came from `source_url`
    async fn find_by_url(&self, source_url: &str) -> Result<Option<MediaRecord>, FetchError>;
}

// ============================================================================
// SQLite
// ============================================================================

/// SQLite-backed media store
#[derive(Clone, Debug)]
pub struct SqliteMediaStore {
    pool: SqlitePool,
}

impl SqliteMediaStore {
    /// Open (creating if missing) the database at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, FetchError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media (
                id TEXT PRIMARY KEY,
                source_url TEXT NOT NULL,
                download_url TEXT NOT NULL,
                suggested_name TEXT NOT NULL,
                size_hint INTEGER,
                checksum TEXT,
                headers TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL,
                file_path TEXT,
                file_size INTEGER,
                progress REAL NOT NULL DEFAULT 0,
                error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                downloaded_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_media_source_url ON media(source_url);
            CREATE INDEX IF NOT EXISTS idx_media_status ON media(status);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    fn row_to_record(row: &SqliteRow) -> Result<MediaRecord, FetchError> {
        let status: String = row.try_get("status")?;
        let headers: String = row.try_get("headers")?;
        let updated_at: String = row.try_get("updated_at")?;
        let downloaded_at: Option<String> = row.try_get("downloaded_at")?;

        Ok(MediaRecord {
            descriptor: Descriptor {
                id: row.try_get("id")?,
                source_url: row.try_get("source_url")?,
                download_url: row.try_get("download_url")?,
                suggested_name: row.try_get("suggested_name")?,
                size_hint: row.try_get::<Option<i64>, _>("size_hint")?.map(|s| s as u64),
                checksum: row.try_get("checksum")?,
                headers: serde_json::from_str(&headers)?,
            },
            status: MediaStatus::parse(&status)
                .ok_or_else(|| FetchError::Persistence(format!("unknown status '{}'", status)))?,
            file_path: row
                .try_get::<Option<String>, _>("file_path")?
                .map(PathBuf::from),
            file_size: row.try_get::<Option<i64>, _>("file_size")?.map(|s| s as u64),
            progress: row.try_get("progress")?,
            error: row.try_get("error")?,
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            updated_at: parse_timestamp(&updated_at)?,
            downloaded_at: downloaded_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, FetchError> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| FetchError::Persistence(format!("bad timestamp '{}': {}", value, e)))
}

#[async_trait]
impl MediaStore for SqliteMediaStore {
    async fn is_completed(&self, id: &str) -> Result<bool, FetchError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM media WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(status.as_deref() == Some(MediaStatus::Completed.as_str()))
    }

    async fn save_state(&self, id: &str, record: &MediaRecord) -> Result<(), FetchError> {
        let descriptor = &record.descriptor;

        sqlx::query(
            r#"
            INSERT INTO media (
                id, source_url, download_url, suggested_name, size_hint, checksum, headers,
                status, file_path, file_size, progress, error, retry_count, updated_at, downloaded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source_url = excluded.source_url,
                download_url = excluded.download_url,
                suggested_name = excluded.suggested_name,
                size_hint = excluded.size_hint,
                checksum = excluded.checksum,
                headers = excluded.headers,
                status = excluded.status,
                file_path = excluded.file_path,
                file_size = excluded.file_size,
                progress = excluded.progress,
                error = excluded.error,
                retry_count = excluded.retry_count,
                updated_at = excluded.updated_at,
                downloaded_at = excluded.downloaded_at
            "#,
        )
        .bind(id)
        .bind(&descriptor.source_url)
        .bind(&descriptor.download_url)
        .bind(&descriptor.suggested_name)
        .bind(descriptor.size_hint.map(|s| s as i64))
        .bind(descriptor.checksum.as_ref())
        .bind(serde_json::to_string(&descriptor.headers)?)
        .bind(record.status.as_str())
        .bind(record.file_path.as_ref().map(|p| p.to_string_lossy().to_string()))
        .bind(record.file_size.map(|s| s as i64))
        .bind(record.progress)
        .bind(record.error.as_ref())
        .bind(record.retry_count as i64)
        .bind(record.updated_at.to_rfc3339())
        .bind(record.downloaded_at.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_progress(&self, id: &str, progress: f64) -> Result<(), FetchError> {
        sqlx::query("UPDATE media SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(progress)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<MediaRecord>, FetchError> {
        let row = sqlx::query("SELECT * FROM media WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn find_by_url(&self, source_url: &str) -> Result<Option<MediaRecord>, FetchError> {
        let row = sqlx::query(
            "SELECT * FROM media WHERE source_url = ? ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(source_url)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local media store for ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryMediaStore {
    records: RwLock<HashMap<String, MediaRecord>>,
}

impl MemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl MediaStore for MemoryMediaStore {
    async fn is_completed(&self, id: &str) -> Result<bool, FetchError> {
        Ok(self
            .records
            .read()
            .get(id)
            .is_some_and(|r| r.status == MediaStatus::Completed))
    }

    async fn save_state(&self, id: &str, record: &MediaRecord) -> Result<(), FetchError> {
        self.records.write().insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn update_progress(&self, id: &str, progress: f64) -> Result<(), FetchError> {
        if let Some(record) = self.records.write().get_mut(id) {
            record.progress = progress;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<MediaRecord>, FetchError> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn find_by_url(&self, source_url: &str) -> Result<Option<MediaRecord>, FetchError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.descriptor.source_url == source_url)
            .max_by_key(|r| r.updated_at)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(id: &str, status: MediaStatus) -> MediaRecord {
        let mut record = MediaRecord::pending(Descriptor {
            id: id.into(),
            source_url: format!("https://video.test/watch/{}", id),
            download_url: format!("https://cdn.test/{}.mp4", id),
            suggested_name: format!("{}.mp4", id),
            size_hint: Some(1024),
            checksum: None,
            headers: [("Referer".to_string(), "https://video.test".to_string())].into(),
        });
        record.status = status;
        record
    }

    #[tokio::test]
    async fn sqlite_round_trips_records_and_tracks_completion() {
        let dir = tempdir().unwrap();
        let store = SqliteMediaStore::new(dir.path().join("db").join("media.db"))
            .await
            .unwrap();

        let mut rec = record("a", MediaStatus::Downloading);
        store.save_state("a", &rec).await.unwrap();
        assert!(!store.is_completed("a").await.unwrap());

        store.update_progress("a", 42.5).await.unwrap();
        let loaded = store.load("a").await.unwrap().unwrap();
        assert_eq!(loaded.progress, 42.5);
        assert_eq!(loaded.descriptor, rec.descriptor);

        rec.status = MediaStatus::Completed;
        rec.file_path = Some(dir.path().join("a.mp4"));
        rec.downloaded_at = Some(Utc::now());
        store.save_state("a", &rec).await.unwrap();
        assert!(store.is_completed("a").await.unwrap());

        let by_url = store
            .find_by_url("https://video.test/watch/a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_url.file_path, rec.file_path);
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_ignores_progress_for_unknown_ids() {
        let store = MemoryMediaStore::new();
        store.update_progress("ghost", 10.0).await.unwrap();
        assert!(store.is_empty());

        store
            .save_state("b", &record("b", MediaStatus::Completed))
            .await
            .unwrap();
        assert!(store.is_completed("b").await.unwrap());
        assert_eq!(store.len(), 1);
    }
}
