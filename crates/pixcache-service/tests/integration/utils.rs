use std::sync::Arc;

use pixcache_service::caching::{DiskStore, MemoryCache};
use pixcache_service::decode::{Image, ImageDecoder};
use pixcache_service::dispatch::{Dispatcher, InlineContext};
use pixcache_service::loader::{ImageLoader, LoadStatus};
use pixcache_test::{CountingStore, ManualExecutor, TempDir, TestFetcher};

pub use pixcache_test::{TestSlot, corrupt_png, png, setup};

pub type TestLoader = ImageLoader<ImageDecoder, CountingStore<DiskStore>>;

/// A loader whose units only run when the test asks for it.
pub struct Harness {
    pub loader: TestLoader,
    pub executor: Arc<ManualExecutor>,
    pub fetcher: Arc<TestFetcher>,
    pub _cache_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(
            MemoryCache::new(100, 1024 * 1024),
            ImageDecoder::default(),
            Dispatcher::new(InlineContext),
        )
    }

    pub fn with(
        memory: MemoryCache<Image>,
        decoder: ImageDecoder,
        dispatcher: Dispatcher,
    ) -> Self {
        setup();

        let cache_dir = pixcache_test::tempdir();
        let store = CountingStore::new(DiskStore::open(cache_dir.path()).unwrap());
        let executor = Arc::new(ManualExecutor::default());
        let fetcher = TestFetcher::new();

        let loader = ImageLoader::new(
            memory,
            store,
            fetcher.clone(),
            decoder,
            executor.clone(),
            dispatcher,
        );

        Self {
            loader,
            executor,
            fetcher,
            _cache_dir: cache_dir,
        }
    }

    pub fn store(&self) -> &CountingStore<DiskStore> {
        self.loader.store()
    }

    /// Serves a 16x16 image filled with `shade` for `key`.
    pub fn serve(&self, key: &str, shade: u8) -> Vec<u8> {
        let bytes = png(16, 16, shade);
        self.fetcher.insert(key, bytes.clone());
        bytes
    }

    pub fn load(&self, slot: &Arc<TestSlot<Image>>, key: &str) -> LoadStatus {
        self.loader.load(slot.clone(), key)
    }
}

/// The gray value of the top left pixel of `image`.
pub fn shade_of(image: &Image) -> u8 {
    image.pixels().as_bytes()[0]
}
