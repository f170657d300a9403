mod common;

use common::{engine_config, payload, peak_active};
use mediafetch_core::{
    BatchCoordinator, CatalogResolver, DownloadManager, FetchError, ManagerConfig,
    MemoryMediaStore, Resolver, ResolverRegistry, TransferEngine,
};
use mediafetch_types::{BatchConfig, BatchKind, BatchStatus, Descriptor, ItemStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CATALOG: &str = "https://catalog.test";

fn item(server: &MockServer, n: usize) -> Descriptor {
    Descriptor {
        id: format!("item-{}", n),
        source_url: format!("{}/watch/{}", CATALOG, n),
        download_url: format!("{}/files/{}.mp4", server.uri(), n),
        suggested_name: format!("clip-{}.mp4", n),
        size_hint: None,
        checksum: None,
        headers: Default::default(),
    }
}

/// Catalog with items 0..count and no fallback resolver
fn registry(server: &MockServer, count: usize) -> ResolverRegistry {
    let mut catalog = CatalogResolver::new().with_collection(
        format!("{}/playlist/all", CATALOG),
        (0..count).map(|n| format!("{}/watch/{}", CATALOG, n)),
    );
    for n in 0..count {
        catalog = catalog.with_item(item(server, n));
    }

    let mut registry = ResolverRegistry::new();
    registry.register("catalog", ["catalog.test"], Resolver::Catalog(catalog));
    registry
}

async fn coordinator(dir: &Path, registry: ResolverRegistry) -> (DownloadManager, BatchCoordinator) {
    let mut config = engine_config(dir);
    config.max_retries = 0;
    let engine = TransferEngine::new(config).await.unwrap();
    let manager = DownloadManager::new(
        engine,
        Arc::new(registry),
        Arc::new(MemoryMediaStore::new()),
        ManagerConfig {
            output_dir: dir.join("library"),
            workers: 2,
            queue_capacity: 8,
            batch_concurrency: 2,
            file_naming: "{name}".to_string(),
            default_extension: "mp4".to_string(),
        },
    );
    manager.start();
    let batches = BatchCoordinator::new(&manager);
    (manager, batches)
}

async fn serve_files(server: &MockServer, count: usize, delay: Duration) {
    for n in 0..count {
        Mock::given(method("GET"))
            .and(path(format!("/files/{}.mp4", n)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(payload(4096 + n))
                    .set_delay(delay),
            )
            .mount(server)
            .await;
    }
}

fn watch_urls(range: impl Iterator<Item = usize>) -> Vec<String> {
    range.map(|n| format!("{}/watch/{}", CATALOG, n)).collect()
}

#[tokio::test]
async fn unresolvable_items_make_the_batch_partial() {
    let server = MockServer::start().await;
    serve_files(&server, 3, Duration::ZERO).await;

    let dir = tempdir().unwrap();
    let (manager, batches) = coordinator(dir.path(), registry(&server, 3)).await;

    // Items 3 and 4 are not in the catalog
    let job = batches
        .run(BatchKind::UrlList, watch_urls(0..5), BatchConfig::default())
        .await
        .unwrap();

    assert_eq!(job.status, BatchStatus::Partial);
    assert!(!job.cancelled);
    assert_eq!(job.progress.total, 5);
    assert_eq!(job.progress.completed, 3);
    assert_eq!(job.progress.failed, 2);
    assert_eq!(job.progress.in_progress, 0);
    assert_eq!(job.progress.percentage, 100.0);
    assert_eq!(job.results.len(), 5);

    for n in 0..3 {
        let file = dir.path().join("library").join(format!("clip-{}.mp4", n));
        assert_eq!(std::fs::read(file).unwrap(), payload(4096 + n));
    }
    let failed: Vec<_> = job
        .results
        .iter()
        .filter(|r| r.status == ItemStatus::Failed)
        .map(|r| r.url.clone())
        .collect();
    assert_eq!(failed.len(), 2);
    assert!(failed.contains(&format!("{}/watch/3", CATALOG)));

    batches.close().await;
    manager.stop().await;
}

#[tokio::test]
async fn batch_where_everything_fails_is_failed() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let (manager, batches) = coordinator(dir.path(), registry(&server, 0)).await;

    let job = batches
        .run(
            BatchKind::UrlList,
            vec![
                format!("{}/watch/9", CATALOG),
                "https://elsewhere.test/video".to_string(),
            ],
            BatchConfig::default(),
        )
        .await
        .unwrap();

    assert_eq!(job.status, BatchStatus::Failed);
    assert_eq!(job.progress.failed, 2);
    assert_eq!(job.progress.completed, 0);

    batches.close().await;
    manager.stop().await;
}

#[tokio::test]
async fn collections_expand_up_to_the_limit() {
    let server = MockServer::start().await;
    serve_files(&server, 4, Duration::ZERO).await;

    let dir = tempdir().unwrap();
    let (manager, batches) = coordinator(dir.path(), registry(&server, 4)).await;

    let job = batches
        .run(
            BatchKind::Collection,
            vec![
                format!("{}/playlist/all", CATALOG),
                format!("{}/playlist/missing", CATALOG),
            ],
            BatchConfig {
                expand_limit: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Three expanded items plus one failed expansion
    assert_eq!(job.progress.total, 4);
    assert_eq!(job.progress.completed, 3);
    assert_eq!(job.progress.failed, 1);
    assert_eq!(job.status, BatchStatus::Partial);
    assert!(!dir.path().join("library").join("clip-3.mp4").exists());

    batches.close().await;
    manager.stop().await;
}

#[tokio::test]
async fn cancelled_batches_skip_remaining_items() {
    let server = MockServer::start().await;
    serve_files(&server, 5, Duration::from_secs(10)).await;

    let dir = tempdir().unwrap();
    let (manager, batches) = coordinator(dir.path(), registry(&server, 5)).await;

    let job = batches
        .start_batch(
            BatchKind::UrlList,
            watch_urls(0..5),
            BatchConfig {
                max_concurrent: 1,
                ..Default::default()
            },
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    batches.cancel_batch(&job.id).unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(5), batches.wait(&job.id))
        .await
        .expect("batch did not stop after cancellation")
        .unwrap();

    assert!(finished.cancelled);
    assert_eq!(finished.progress.failed, 0);
    assert_eq!(finished.progress.completed, 0);
    assert_eq!(finished.progress.skipped, 5);
    assert_eq!(finished.status, BatchStatus::Completed);
    assert!(finished.status.is_finished());

    batches.close().await;
    manager.stop().await;
}

#[tokio::test]
async fn duplicate_items_do_not_fail_each_other() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/0.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(payload(4096))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let (manager, batches) = coordinator(dir.path(), registry(&server, 1)).await;
    let url = format!("{}/watch/0", CATALOG);

    let job = batches
        .run(
            BatchKind::UrlList,
            vec![url.clone(), url],
            BatchConfig {
                max_concurrent: 2,
                skip_existing: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(job.status, BatchStatus::Completed);
    assert_eq!(job.progress.failed, 0);
    assert_eq!(job.progress.completed, 2);
    assert!(job.results.iter().all(|r| r.error.is_none()));
    assert_eq!(
        std::fs::read(dir.path().join("library").join("clip-0.mp4")).unwrap(),
        payload(4096)
    );

    batches.close().await;
    manager.stop().await;
}

#[tokio::test]
async fn batch_items_respect_the_concurrency_limit() {
    let server = MockServer::start().await;
    serve_files(&server, 8, Duration::from_millis(200)).await;

    let dir = tempdir().unwrap();
    let (manager, batches) = coordinator(dir.path(), registry(&server, 8)).await;

    let done = CancellationToken::new();
    let poller = tokio::spawn(peak_active(manager.engine().clone(), done.clone()));
    let job = batches
        .run(
            BatchKind::UrlList,
            watch_urls(0..8),
            BatchConfig {
                max_concurrent: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    done.cancel();
    let peak = poller.await.unwrap();

    assert_eq!(job.progress.completed, 8);
    assert!(peak >= 1);
    assert!(peak <= 2, "{} transfers ran at once", peak);

    batches.close().await;
    manager.stop().await;
}

#[tokio::test]
async fn existing_outputs_are_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/0.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(10)))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/1.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(10)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let (manager, batches) = coordinator(dir.path(), registry(&server, 2)).await;

    let out_dir: PathBuf = dir.path().join("existing");
    std::fs::create_dir_all(&out_dir).unwrap();
    std::fs::write(out_dir.join("clip-0.mp4"), b"already here").unwrap();

    let job = batches
        .run(
            BatchKind::UrlList,
            watch_urls(0..2),
            BatchConfig {
                output_dir: Some(out_dir.clone()),
                skip_existing: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(job.progress.skipped, 1);
    assert_eq!(job.progress.completed, 1);
    assert_eq!(job.status, BatchStatus::Completed);
    assert_eq!(
        std::fs::read(out_dir.join("clip-0.mp4")).unwrap(),
        b"already here"
    );

    batches.close().await;
    manager.stop().await;
}

#[tokio::test]
async fn batches_are_listed_and_validated() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let (manager, batches) = coordinator(dir.path(), registry(&server, 0)).await;

    assert!(matches!(
        batches.start_batch(BatchKind::UrlList, Vec::new(), BatchConfig::default()),
        Err(FetchError::InvalidOperation(_))
    ));
    assert!(matches!(
        batches.cancel_batch("batch_missing"),
        Err(FetchError::NotFound(_))
    ));

    let job = batches
        .start_batch(
            BatchKind::UrlList,
            vec!["https://nowhere.test/x".to_string()],
            BatchConfig::default(),
        )
        .unwrap();
    assert!(job.id.starts_with("batch_"));
    batches.wait(&job.id).await.unwrap();
    assert_eq!(batches.batches().len(), 1);
    assert_eq!(batches.batch(&job.id).unwrap().status, BatchStatus::Failed);

    batches.close().await;
    assert!(matches!(
        batches.start_batch(
            BatchKind::UrlList,
            vec!["https://nowhere.test/y".to_string()],
            BatchConfig::default()
        ),
        Err(FetchError::Shutdown)
    ));
    manager.stop().await;
}
