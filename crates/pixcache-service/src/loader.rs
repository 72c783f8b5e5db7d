//! The image loader, tying together caches, fetcher, task registry and dispatcher.
//!
//! Each load goes through the resolver chain
//! `CheckMemory → CheckStore → Fetch → Persist → Promote → Deliver`:
//!
//! - `CheckMemory` happens synchronously inside [`ImageLoader::load`]. A hit is applied to the
//!   slot right away. On a miss, the slot shows its placeholder and the rest of the chain is
//!   handed to a background unit through the [`TaskRegistry`].
//! - `CheckStore` reads and decodes the durable entry. A missing, unreadable or corrupted entry
//!   just moves on to the network.
//! - `Fetch` downloads the bytes. Any failure ends the load, the slot keeps its placeholder.
//! - `Persist` stages the bytes in the store and atomically promotes them into place.
//! - `Promote` reads the persisted entry back and decodes it, exactly like a store hit.
//! - `Deliver` hands the image to every waiting slot through the [`Dispatcher`].
//!
//! A background unit checks that it is still wanted when it starts, and again before `Fetch` and
//! `Promote`. A unit cancelled during `Fetch` still persists what it downloaded, so future loads
//! find it in the store, but it does not decode or deliver it.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use tokio::runtime::Handle;

use crate::caching::{DiskStore, LoadError, LoadResult, MemoryCache, ResourceKey, Store};
use crate::config::Config;
use crate::decode::{Decoder, ImageDecoder};
use crate::dispatch::{ConsumerContext, Dispatcher, Slot, apply_if_interested};
use crate::download::{Fetcher, FilesystemFetcher, HttpFetcher};
use crate::executor::{Executor, WorkerPool};
use crate::registry::{TaskId, TaskRegistry};
use crate::utils::defer::defer;
use crate::utils::http::{DownloadTimeouts, create_client};

/// A slot interested in resources of type `R`.
pub type SlotRef<R> = Arc<dyn Slot<R>>;

/// The synchronous outcome of [`ImageLoader::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// The image was in memory and was applied to the slot.
    Hit,
    /// The slot shows its placeholder, the image is loaded in the background.
    Pending,
    /// There was nothing to load.
    Ignored,
}

struct Engine<D: Decoder, S> {
    memory: MemoryCache<D::Resource>,
    registry: TaskRegistry<SlotRef<D::Resource>>,
    store: S,
    fetcher: Arc<dyn Fetcher>,
    decoder: D,
    executor: Arc<dyn Executor>,
    dispatcher: Dispatcher,
}

/// Loads images into slots, caching them in memory and in a durable [`Store`].
///
/// Cloning the loader is cheap, all clones share the same caches and in-flight loads.
pub struct ImageLoader<D: Decoder, S = DiskStore> {
    inner: Arc<Engine<D, S>>,
}

impl<D: Decoder, S> Clone for ImageLoader<D, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Decoder, S> fmt::Debug for ImageLoader<D, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageLoader")
            .field("memory", &self.inner.memory)
            .field("registry", &self.inner.registry)
            .field("fetcher", &self.inner.fetcher)
            .finish_non_exhaustive()
    }
}

impl ImageLoader<ImageDecoder, DiskStore> {
    /// Creates a loader fetching over HTTP, or from a local directory, and storing images on
    /// disk, as configured.
    ///
    /// Background units are spawned onto `runtime`, deliveries happen on `context`.
    pub fn from_config(
        config: &Config,
        runtime: Handle,
        context: impl ConsumerContext,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let cache_dir = config
            .cache_dir
            .as_ref()
            .context("no cache_dir configured")?;
        let store = DiskStore::open(cache_dir)
            .with_context(|| format!("failed to open image store at {}", cache_dir.display()))?;

        let fetcher: Arc<dyn Fetcher> = match (&config.source_url, &config.source_dir) {
            (Some(source_url), _) => {
                let timeouts = DownloadTimeouts::from_config(config);
                let client = create_client(&timeouts);
                Arc::new(HttpFetcher::new(client, source_url.clone(), timeouts))
            }
            (None, Some(source_dir)) => Arc::new(FilesystemFetcher::new(source_dir)),
            (None, None) => anyhow::bail!("no source_url or source_dir configured"),
        };

        Ok(Self::new(
            MemoryCache::from_config(&config.caches.in_memory),
            store,
            fetcher,
            ImageDecoder::new(config.max_decoded_size),
            Arc::new(WorkerPool::new(runtime, config.max_concurrent_fetches)),
            Dispatcher::new(context),
        ))
    }
}

impl<D: Decoder, S: Store> ImageLoader<D, S> {
    pub fn new(
        memory: MemoryCache<D::Resource>,
        store: S,
        fetcher: Arc<dyn Fetcher>,
        decoder: D,
        executor: Arc<dyn Executor>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            inner: Arc::new(Engine {
                memory,
                registry: TaskRegistry::new(),
                store,
                fetcher,
                decoder,
                executor,
                dispatcher,
            }),
        }
    }

    /// Loads the image for `key` into `slot`.
    ///
    /// The slot must already be interested in `key`. This must be called on the consumer's
    /// context, and never blocks: an image cached in memory is applied right away, anything
    /// else is loaded in the background and delivered later, if the slot is still interested
    /// in `key` by then.
    pub fn load(&self, slot: SlotRef<D::Resource>, key: &str) -> LoadStatus {
        metric!(counter("loads.access") += 1);
        let Some(key) = ResourceKey::new(key) else {
            tracing::trace!("Ignoring load without a key");
            return LoadStatus::Ignored;
        };

        if let Some(resource) = self.inner.memory.get(&key) {
            metric!(counter("loads.memory.hit") += 1);
            apply_if_interested(&*slot, &key, resource);
            return LoadStatus::Hit;
        }

        slot.show_placeholder();

        let engine = Arc::clone(&self.inner);
        let unit_key = key.clone();
        let registration = self.inner.registry.start_or_replace(
            key.clone(),
            slot,
            &*self.inner.executor,
            move |id| Box::pin(engine.run(unit_key, id)),
        );
        tracing::trace!(%key, ?registration, "Loading image in the background");

        LoadStatus::Pending
    }

    /// Cancels the background load of `key`, returning whether there was one.
    ///
    /// A load that did not start yet will not do any I/O. A load that already started finishes
    /// its download and persists it, but delivers to no one.
    pub fn cancel(&self, key: &str) -> bool {
        let Some(key) = ResourceKey::new(key) else {
            return false;
        };
        self.inner.registry.cancel(&key, &*self.inner.executor)
    }

    /// Drops all images held in memory.
    ///
    /// The durable store and in-flight loads are not affected.
    pub fn clear(&self) {
        tracing::debug!("Clearing in-memory images");
        self.inner.memory.clear();
    }

    /// Returns the image for `key` if it is held in memory.
    pub fn get_cached(&self, key: &str) -> Option<Arc<D::Resource>> {
        self.inner.memory.get(&ResourceKey::new(key)?)
    }

    /// Whether a background load for `key` is registered.
    pub fn is_loading(&self, key: &str) -> bool {
        ResourceKey::new(key).is_some_and(|key| self.inner.registry.contains(&key))
    }

    pub fn memory(&self) -> &MemoryCache<D::Resource> {
        &self.inner.memory
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }
}

impl<D: Decoder, S: Store> Engine<D, S> {
    /// The background part of a load.
    async fn run(self: Arc<Self>, key: ResourceKey, id: TaskId) {
        if !self.registry.begin(&key, id) {
            tracing::trace!(%key, task = %id, "Load was superseded before it started");
            metric!(counter("loads.superseded") += 1);
            return;
        }

        // Unregisters the task even if this unit is dropped halfway.
        let _unregister = {
            let engine = Arc::clone(&self);
            let key = key.clone();
            defer(move || {
                engine.registry.finish(&key, id);
            })
        };

        let start = Instant::now();
        let result = self.resolve(&key, id).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(err) => err.metrics_tag(),
        };
        metric!(timer("loads.duration") = start.elapsed(), "status" => status);

        let waiters = self.registry.finish(&key, id);
        match result {
            Ok(resource) => {
                if waiters.is_empty() {
                    tracing::trace!(%key, task = %id, "Load was cancelled, not delivering");
                }
                for slot in waiters {
                    self.dispatcher.deliver(slot, key.clone(), Arc::clone(&resource));
                }
            }
            Err(error) if error.is_superseded() => {
                tracing::trace!(%key, task = %id, "Load was superseded");
                metric!(counter("loads.superseded") += 1);
            }
            Err(LoadError::ResourceExhausted) => {
                tracing::warn!(%key, "Out of memory while loading image, clearing in-memory images");
                self.memory.clear();
            }
            Err(error) => {
                tracing::debug!(%key, %error, "Failed to load image");
            }
        }
    }

    async fn resolve(&self, key: &ResourceKey, id: TaskId) -> LoadResult<Arc<D::Resource>> {
        if let Some(resource) = self.check_store(key)? {
            metric!(counter("loads.store.hit") += 1);
            return Ok(resource);
        }

        self.ensure_current(key, id)?;
        let bytes = self.fetch(key).await?;
        self.persist(key, &bytes)?;

        self.ensure_current(key, id)?;
        self.read_promoted(key)
    }

    fn ensure_current(&self, key: &ResourceKey, id: TaskId) -> LoadResult<()> {
        match self.registry.is_current(key, id) {
            true => Ok(()),
            false => Err(LoadError::Superseded),
        }
    }

    /// Looks up `key` in the durable store.
    ///
    /// Only running out of memory is an error here, every other failure counts as a miss.
    fn check_store(&self, key: &ResourceKey) -> LoadResult<Option<Arc<D::Resource>>> {
        if !self.store.exists(key) {
            return Ok(None);
        }

        let bytes = match self.store.read(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(error) => {
                tracing::debug!(%key, %error, "Failed to read image from store");
                return Ok(None);
            }
        };

        match self.decode(key, bytes) {
            Ok(resource) => Ok(Some(resource)),
            Err(LoadError::ResourceExhausted) => Err(LoadError::ResourceExhausted),
            Err(error) => {
                // The entry stays where it is, it gets replaced once the fetch succeeds.
                tracing::debug!(%key, %error, "Ignoring unusable store entry");
                Ok(None)
            }
        }
    }

    async fn fetch(&self, key: &ResourceKey) -> LoadResult<Bytes> {
        let result = self.fetcher.fetch(key).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(err) => err.metrics_tag(),
        };
        metric!(counter("loads.fetch") += 1, "status" => status);
        if let Ok(bytes) = &result {
            metric!(histogram("loads.fetch.size") = bytes.len() as u64);
        }

        result
    }

    fn persist(&self, key: &ResourceKey, bytes: &[u8]) -> LoadResult<()> {
        let staged = self.store.write_temp(key, bytes).inspect_err(|error| {
            tracing::error!(%key, %error, "Failed to stage image in store");
        })?;
        self.store.promote(staged, key).inspect_err(|error| {
            tracing::error!(%key, %error, "Failed to promote image in store");
        })?;

        metric!(counter("loads.store.write") += 1);
        Ok(())
    }

    /// Reads back a freshly persisted entry.
    ///
    /// Unlike [`check_store`](Self::check_store), a missing or corrupted entry fails the load.
    fn read_promoted(&self, key: &ResourceKey) -> LoadResult<Arc<D::Resource>> {
        let bytes = self.store.read(key)?.ok_or(LoadError::NotFound)?;
        self.decode(key, bytes)
    }

    fn decode(&self, key: &ResourceKey, bytes: Bytes) -> LoadResult<Arc<D::Resource>> {
        let resource = self.decoder.decode(bytes)?;
        let size = self.decoder.size_of(&resource);

        let resource = Arc::new(resource);
        self.memory.put(key.clone(), Arc::clone(&resource), size);
        Ok(resource)
    }
}
