//! MediaFetch Core - Media Fetch Engine
//!
//! Resumable single-file transfers, a worker-pool download manager with
//! idempotency against a media store, batch coordination, and segmented
//! stream downloads. [`MediaFetch`] wires them together over one data
//! directory.

mod batch;
mod config;
mod engine;
mod error;
mod gate;
mod manager;
mod naming;
mod resolver;
mod store;
mod stream;

pub use batch::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use gate::*;
pub use manager::*;
pub use naming::*;
pub use resolver::*;
pub use store::*;
pub use stream::*;

use mediafetch_types::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// The main MediaFetch instance
pub struct MediaFetch {
    paths: Paths,
    settings: Settings,
    manager: Arc<DownloadManager>,
    batches: BatchCoordinator,
    streams: SegmentedStreamDownloader,
}

impl MediaFetch {
    /// Open the data directory with the settings stored there and the
    /// direct resolver as the only route
    pub async fn open(data_dir: PathBuf) -> Result<Self, FetchError> {
        let paths = Paths::new(data_dir);
        let settings = load_settings(&paths.settings_file).await?;
        Self::open_with(paths, settings, ResolverRegistry::with_direct_fallback()).await
    }

    /// Open with explicit settings and resolvers. Interrupted transfers
    /// found in the metadata directory come back as paused jobs.
    pub async fn open_with(
        paths: Paths,
        settings: Settings,
        resolvers: ResolverRegistry,
    ) -> Result<Self, FetchError> {
        paths.ensure().await?;

        let engine = TransferEngine::new(EngineConfig::from_settings(
            &settings,
            &paths.meta_dir,
            &paths.temp_dir,
        ))
        .await?;
        let store = SqliteMediaStore::new(&paths.database).await?;

        let manager = Arc::new(DownloadManager::new(
            engine,
            Arc::new(resolvers),
            Arc::new(store),
            ManagerConfig::from_settings(&settings),
        ));
        manager.start();

        let batches = BatchCoordinator::new(&manager);
        let streams =
            SegmentedStreamDownloader::new(StreamConfig::from_settings(&settings, &paths.segments_dir))?;

        info!("MediaFetch opened at {:?}", paths.data_dir);

        Ok(Self {
            paths,
            settings,
            manager,
            batches,
            streams,
        })
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn manager(&self) -> &DownloadManager {
        &self.manager
    }

    pub fn engine(&self) -> &TransferEngine {
        self.manager.engine()
    }

    pub fn batches(&self) -> &BatchCoordinator {
        &self.batches
    }

    pub fn streams(&self) -> &SegmentedStreamDownloader {
        &self.streams
    }

    /// Cancel batches, stop the workers and pause in-flight transfers
    pub async fn shutdown(&self) {
        self.batches.close().await;
        self.manager.stop().await;
        info!("MediaFetch shut down");
    }
}
