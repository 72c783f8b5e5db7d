//! Helpers for testing the image loader.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the store directories are removed
//!    while the loader still uses them.
//!
//!  - When using [`ImageServer`], make sure that the server is held until all requests to
//!    the server have been made. The server stops serving when dropped.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Router, middleware};
use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::sync::Notify;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use pixcache_service::caching::{LoadError, LoadResult, ResourceKey, Store};
use pixcache_service::dispatch::Slot;
use pixcache_service::download::Fetcher;
use pixcache_service::executor::{Executor, WorkHandle, WorkUnit};

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `pixcache_service` crate and
///    mutes all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("pixcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Encodes a PNG image of the given dimensions, filled with a single gray `shade`.
pub fn png(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let pixels = RgbaImage::from_pixel(width, height, Rgba([shade, shade, shade, 255]));
    let mut encoded = Cursor::new(Vec::new());
    pixels.write_to(&mut encoded, ImageFormat::Png).unwrap();
    encoded.into_inner()
}

/// Damages the compressed pixel data of a PNG image, keeping its header and trailer intact.
pub fn corrupt_png(mut png: Vec<u8>) -> Vec<u8> {
    let idat = png.windows(4).position(|w| w == b"IDAT").unwrap();
    for byte in &mut png[idat + 4..idat + 8] {
        *byte ^= 0xff;
    }
    png
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Deserialize)]
struct ImageQuery {
    name: String,
}

type Images = Arc<Mutex<HashMap<String, Bytes>>>;

fn serve_image(images: &Images, name: &str) -> axum::response::Response {
    match images.lock().unwrap().get(name) {
        Some(bytes) => (StatusCode::OK, bytes.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// An image server counting the requests it receives.
///
/// Images added with [`insert`](Self::insert) are served at `/image?name=<name>`. Additional
/// routes simulate misbehaving servers, use them as the base URL of the fetcher:
///
/// - `/delay/<duration>/` serves images after sleeping for the given duration.
/// - `/respond_statuscode/<code>/` responds with the given status code.
/// - `/garbage_data/` responds with bytes that are not an image.
pub struct ImageServer {
    server: Server,
    images: Images,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl ImageServer {
    pub fn new() -> Self {
        let images: Images = Default::default();
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri,
                  req: extract::Request,
                  next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/image",
                get({
                    let images = images.clone();
                    move |extract::Query(query): extract::Query<ImageQuery>| async move {
                        serve_image(&images, &query.name)
                    }
                }),
            )
            .route(
                "/delay/:time/image",
                get({
                    let images = images.clone();
                    move |extract::Path(time): extract::Path<String>,
                          extract::Query(query): extract::Query<ImageQuery>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;
                        serve_image(&images, &query.name)
                    }
                }),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self {
            server,
            images,
            hits,
        }
    }

    /// Serves `bytes` as the image `name`.
    pub fn insert(&self, name: &str, bytes: impl Into<Bytes>) {
        self.images
            .lock()
            .unwrap()
            .insert(name.to_owned(), bytes.into());
    }

    /// Returns the total number of requests and resets the counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns all requested URIs with their hit counts and resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for ImageServer {
    fn default() -> Self {
        Self::new()
    }
}

/// An [`Executor`] that only runs units when the test asks it to.
#[derive(Default)]
pub struct ManualExecutor {
    queue: Mutex<VecDeque<(WorkHandle, WorkUnit)>>,
    submitted: AtomicUsize,
}

impl Executor for ManualExecutor {
    fn submit(&self, unit: WorkUnit) -> WorkHandle {
        let handle = WorkHandle::new();
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .unwrap()
            .push_back((handle.clone(), unit));
        handle
    }
}

impl ManualExecutor {
    /// The number of units submitted so far.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    /// The number of units that are still waiting to run.
    pub fn queued(&self) -> usize {
        let queue = self.queue.lock().unwrap();
        queue.iter().filter(|(handle, _)| handle.is_queued()).count()
    }

    /// Takes the next unit that was not removed, marking it as started.
    ///
    /// The caller is responsible for running it.
    pub fn start_next(&self) -> Option<WorkUnit> {
        loop {
            let (handle, unit) = self.queue.lock().unwrap().pop_front()?;
            if handle.try_start() {
                return Some(unit);
            }
        }
    }

    /// Runs the next unit that was not removed, returning whether there was one.
    pub async fn run_next(&self) -> bool {
        match self.start_next() {
            Some(unit) => {
                unit.await;
                true
            }
            None => false,
        }
    }

    /// Runs units until the queue is empty, returning how many ran.
    pub async fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next().await {
            ran += 1;
        }
        ran
    }
}

/// A [`Slot`] recording what it was asked to show.
pub struct TestSlot<R> {
    interest: Mutex<Option<ResourceKey>>,
    applied: Mutex<Vec<(ResourceKey, Arc<R>)>>,
    placeholders: AtomicUsize,
}

impl<R> TestSlot<R> {
    /// Creates a slot interested in `key`.
    pub fn new(key: &str) -> Arc<Self> {
        Arc::new(Self {
            interest: Mutex::new(ResourceKey::new(key)),
            applied: Mutex::new(Vec::new()),
            placeholders: AtomicUsize::new(0),
        })
    }

    /// Reuses the slot for `key`.
    pub fn want(&self, key: &str) {
        *self.interest.lock().unwrap() = ResourceKey::new(key);
    }

    /// The keys of all resources applied to this slot, in order.
    pub fn applied_keys(&self) -> Vec<String> {
        let applied = self.applied.lock().unwrap();
        applied.iter().map(|(key, _)| key.to_string()).collect()
    }

    /// The resource that was applied last.
    pub fn shown(&self) -> Option<Arc<R>> {
        let applied = self.applied.lock().unwrap();
        applied.last().map(|(_, resource)| Arc::clone(resource))
    }

    /// How many times the slot was asked to show its placeholder.
    pub fn placeholders(&self) -> usize {
        self.placeholders.load(Ordering::SeqCst)
    }
}

impl<R: Send + Sync + 'static> Slot<R> for TestSlot<R> {
    fn interest_key(&self) -> Option<ResourceKey> {
        self.interest.lock().unwrap().clone()
    }

    fn apply(&self, key: &ResourceKey, resource: Arc<R>) {
        self.applied.lock().unwrap().push((key.clone(), resource));
    }

    fn show_placeholder(&self) {
        self.placeholders.fetch_add(1, Ordering::SeqCst);
    }
}

/// A [`Fetcher`] serving images from memory, counting fetches per key.
///
/// When [`gate`](Self::gate) is set, fetches wait until [`open`](Self::open) is called, so tests
/// can act while a unit is in the middle of its I/O.
#[derive(Debug, Default)]
pub struct TestFetcher {
    images: Mutex<HashMap<String, Bytes>>,
    fetches: Mutex<HashMap<String, usize>>,
    gated: Mutex<bool>,
    entered: Notify,
    gate: Notify,
}

impl TestFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serves `bytes` for `key`.
    pub fn insert(&self, key: &str, bytes: impl Into<Bytes>) {
        self.images
            .lock()
            .unwrap()
            .insert(key.to_owned(), bytes.into());
    }

    /// Makes fetches wait for [`open`](Self::open).
    pub fn gate(&self) {
        *self.gated.lock().unwrap() = true;
    }

    /// Lets all waiting and future fetches through.
    pub fn open(&self) {
        *self.gated.lock().unwrap() = false;
        self.gate.notify_waiters();
    }

    /// Resolves once a fetch is waiting at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await
    }

    /// The number of fetches for `key`.
    pub fn fetches(&self, key: &str) -> usize {
        self.fetches.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// The number of fetches for all keys.
    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Fetcher for TestFetcher {
    async fn fetch(&self, key: &ResourceKey) -> LoadResult<Bytes> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default() += 1;

        loop {
            let opened = self.gate.notified();
            if !*self.gated.lock().unwrap() {
                break;
            }
            self.entered.notify_one();
            opened.await;
        }

        let images = self.images.lock().unwrap();
        images.get(key.as_str()).cloned().ok_or(LoadError::NotFound)
    }
}

/// A [`Store`] wrapper counting reads and promoted writes.
#[derive(Debug)]
pub struct CountingStore<S> {
    inner: S,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl<S> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// The number of reads, including reads of absent entries.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// The number of promoted writes.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl<S: Store> Store for CountingStore<S> {
    type Staged = S::Staged;

    fn exists(&self, key: &ResourceKey) -> bool {
        self.inner.exists(key)
    }

    fn read(&self, key: &ResourceKey) -> LoadResult<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(key)
    }

    fn write_temp(&self, key: &ResourceKey, bytes: &[u8]) -> LoadResult<Self::Staged> {
        self.inner.write_temp(key, bytes)
    }

    fn promote(&self, staged: Self::Staged, key: &ResourceKey) -> LoadResult<()> {
        self.inner.promote(staged, key)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
