use std::time::Duration;

use tokio::runtime::Handle;

use pixcache_service::caching::{LoadError, ResourceKey};
use pixcache_service::config::Config;
use pixcache_service::decode::Image;
use pixcache_service::dispatch::{ContextReceiver, channel_context};
use pixcache_service::download::{Fetcher, HttpFetcher};
use pixcache_service::loader::{ImageLoader, LoadStatus};
use pixcache_service::utils::http::{DownloadTimeouts, create_client};
use pixcache_test::ImageServer;

use crate::utils::{TestSlot, png, setup};

fn http_fetcher(server: &ImageServer, path: &str, timeouts: DownloadTimeouts) -> HttpFetcher {
    HttpFetcher::new(create_client(&timeouts), server.url(path), timeouts)
}

fn key(k: &str) -> ResourceKey {
    ResourceKey::new(k).unwrap()
}

async fn next_delivery(receiver: &mut ContextReceiver) {
    let delivered = tokio::time::timeout(Duration::from_secs(5), receiver.run_next())
        .await
        .expect("no delivery within 5s");
    assert!(delivered);
}

#[tokio::test]
async fn test_fetch() {
    setup();
    let server = ImageServer::new();
    let bytes = png(8, 8, 0);
    server.insert("app/icon 1.png", bytes.clone());

    let fetcher = http_fetcher(&server, "/", DownloadTimeouts::default());
    let fetched = fetcher.fetch(&key("app/icon 1.png")).await.unwrap();
    assert_eq!(&fetched[..], &bytes[..]);

    assert_eq!(
        server.all_hits(),
        vec![("/image?name=app%2Ficon+1.png".to_owned(), 1)]
    );
}

#[tokio::test]
async fn test_fetch_base_without_trailing_slash() {
    setup();
    let server = ImageServer::new();
    server.insert("a.png", png(8, 8, 0));

    let fetcher = http_fetcher(&server, "delay/0s", DownloadTimeouts::default());
    fetcher.fetch(&key("a.png")).await.unwrap();

    assert_eq!(
        server.all_hits(),
        vec![("/delay/0s/image?name=a.png".to_owned(), 1)]
    );
}

#[tokio::test]
async fn test_fetch_status_codes() {
    setup();
    let server = ImageServer::new();

    let cases = [
        ("respond_statuscode/403/", "permission denied"),
        ("respond_statuscode/404/", "not found"),
        ("respond_statuscode/500/", "download failed"),
    ];
    for (path, expected) in cases {
        let fetcher = http_fetcher(&server, path, DownloadTimeouts::default());
        let error = fetcher.fetch(&key("a.png")).await.unwrap_err();
        assert!(error.to_string().starts_with(expected), "{path}: {error}");
    }

    let fetcher = http_fetcher(&server, "/", DownloadTimeouts::default());
    let error = fetcher.fetch(&key("missing.png")).await.unwrap_err();
    assert_eq!(error, LoadError::NotFound);

    assert_eq!(server.accesses(), 4);
}

#[tokio::test]
async fn test_fetch_timeout() {
    setup();
    let server = ImageServer::new();
    server.insert("a.png", png(8, 8, 0));

    let timeouts = DownloadTimeouts {
        connect: Duration::from_secs(1),
        max_download: Duration::from_millis(100),
    };
    let fetcher = http_fetcher(&server, "delay/1s/", timeouts);
    let error = fetcher.fetch(&key("a.png")).await.unwrap_err();
    assert_eq!(error, LoadError::Timeout(Duration::from_millis(100)));
}

#[tokio::test]
async fn test_load_end_to_end() {
    setup();
    let server = ImageServer::new();
    server.insert("a.png", png(32, 24, 0));

    let cache_dir = pixcache_test::tempdir();
    let config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        source_url: Some(server.url("/")),
        ..Default::default()
    };

    let (context, mut receiver) = channel_context();
    let loader = ImageLoader::from_config(&config, Handle::current(), context).unwrap();

    let slot = TestSlot::<Image>::new("a.png");
    assert_eq!(loader.load(slot.clone(), "a.png"), LoadStatus::Pending);
    next_delivery(&mut receiver).await;

    assert_eq!(slot.applied_keys(), vec!["a.png"]);
    assert_eq!(slot.shown().unwrap().dimensions(), (32, 24));
    assert_eq!(server.accesses(), 1);
    assert_eq!(loader.load(slot.clone(), "a.png"), LoadStatus::Hit);

    // a fresh loader on the same store does not go to the network
    let (context, mut receiver) = channel_context();
    let loader = ImageLoader::from_config(&config, Handle::current(), context).unwrap();

    let slot = TestSlot::<Image>::new("a.png");
    assert_eq!(loader.load(slot.clone(), "a.png"), LoadStatus::Pending);
    next_delivery(&mut receiver).await;

    assert_eq!(slot.applied_keys(), vec!["a.png"]);
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_load_garbage_data() {
    setup();
    let server = ImageServer::new();

    let cache_dir = pixcache_test::tempdir();
    let config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        source_url: Some(server.url("garbage_data/")),
        ..Default::default()
    };

    let (context, mut receiver) = channel_context();
    let loader = ImageLoader::from_config(&config, Handle::current(), context).unwrap();

    let slot = TestSlot::<Image>::new("a.png");
    assert_eq!(loader.load(slot.clone(), "a.png"), LoadStatus::Pending);

    tokio::time::timeout(Duration::from_secs(5), async {
        while loader.is_loading("a.png") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(receiver.run_pending(), 0);
    assert!(slot.applied_keys().is_empty());
    assert_eq!(slot.placeholders(), 1);
    assert!(loader.memory().is_empty());
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_load_from_source_dir() {
    setup();
    let source_dir = pixcache_test::tempdir();
    std::fs::write(source_dir.path().join("a.png"), png(4, 4, 0)).unwrap();

    let cache_dir = pixcache_test::tempdir();
    let config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        source_dir: Some(source_dir.path().to_owned()),
        ..Default::default()
    };

    let (context, mut receiver) = channel_context();
    let loader = ImageLoader::from_config(&config, Handle::current(), context).unwrap();

    let slot = TestSlot::<Image>::new("a.png");
    assert_eq!(loader.load(slot.clone(), "a.png"), LoadStatus::Pending);
    next_delivery(&mut receiver).await;

    assert_eq!(slot.shown().unwrap().dimensions(), (4, 4));
}

#[test]
fn test_from_config_requires_source() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let cache_dir = pixcache_test::tempdir();
    let config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };

    let (context, _receiver) = channel_context();
    let error = ImageLoader::from_config(&config, runtime.handle().clone(), context).unwrap_err();
    assert_eq!(error.to_string(), "no source_url or source_dir configured");
}
