use std::fmt;
use std::sync::{Arc, OnceLock};

use console::style;

use pixcache_service::caching::ResourceKey;
use pixcache_service::decode::Image;
use pixcache_service::dispatch::Slot;
use pixcache_service::loader::LoadStatus;

/// A slot that remembers the image it was given, to be printed once all loads are done.
pub struct ConsoleSlot {
    key: Option<ResourceKey>,
    image: OnceLock<Arc<Image>>,
}

impl fmt::Debug for ConsoleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleSlot")
            .field("key", &self.key)
            .field("loaded", &self.image.get().is_some())
            .finish()
    }
}

impl ConsoleSlot {
    pub fn new(key: &str) -> Arc<Self> {
        Arc::new(Self {
            key: ResourceKey::new(key),
            image: OnceLock::new(),
        })
    }

    pub fn image(&self) -> Option<&Arc<Image>> {
        self.image.get()
    }

    /// Renders the outcome of loading into this slot.
    pub fn describe(&self, status: LoadStatus) -> String {
        let Some(key) = &self.key else {
            return format!("{} (empty key)", style("skipped").dim());
        };

        let label = match (status, self.image()) {
            (LoadStatus::Hit, _) => style("hit").green(),
            (_, Some(_)) => style("loaded").cyan(),
            (_, None) => style("failed").red(),
        };

        match self.image() {
            Some(image) => {
                let (width, height) = image.dimensions();
                format!(
                    "{label} {key} ({}, {width}x{height}, {} bytes)",
                    image.format,
                    image.byte_size()
                )
            }
            None => format!("{label} {key} (placeholder)"),
        }
    }
}

impl Slot<Image> for ConsoleSlot {
    fn interest_key(&self) -> Option<ResourceKey> {
        self.key.clone()
    }

    fn apply(&self, key: &ResourceKey, resource: Arc<Image>) {
        if self.image.set(resource).is_err() {
            tracing::debug!(%key, "Slot already shows an image");
        }
    }

    fn show_placeholder(&self) {
        if let Some(key) = &self.key {
            tracing::trace!(%key, "Showing placeholder");
        }
    }
}
