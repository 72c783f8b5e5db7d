use std::borrow::Borrow;
use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// The identity of a remote image.
///
/// A key is the normalized (trimmed, non-empty) name or URL of an image. It is the join key
/// between the in-memory cache, the task registry, the durable store and the consumer slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    /// Creates a new key, returning `None` for keys that are empty after trimming.
    pub fn new(key: impl AsRef<str>) -> Option<Self> {
        let key = key.as_ref().trim();
        if key.is_empty() {
            return None;
        }
        Some(Self(key.into()))
    }

    /// Returns the normalized key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the relative path of this key inside the durable store.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        let hash = Sha256::digest(self.0.as_bytes());

        let mut path = format!("{:02x}/", hash[0]);
        for b in &hash[1..4] {
            // writing into a `String` is infallible
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ResourceKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}
