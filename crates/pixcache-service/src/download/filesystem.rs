//! Support to fetch images from the local filesystem.
//!
//! It allows images to be served from a local directory, usually only used for testing and
//! offline use.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use crate::caching::{LoadError, LoadResult, ResourceKey};

use super::Fetcher;

/// Fetcher implementation that reads images from a local directory.
#[derive(Debug, Clone)]
pub struct FilesystemFetcher {
    root: PathBuf,
}

impl FilesystemFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Fetcher for FilesystemFetcher {
    async fn fetch(&self, key: &ResourceKey) -> LoadResult<Bytes> {
        let relative = key.as_str().trim_start_matches('/');
        if relative.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(LoadError::NotFound);
        }

        let path = self.root.join(relative);
        tracing::debug!("Fetching image from {:?}", path);

        let data = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LoadError::NotFound,
            _ => LoadError::DownloadError(e.to_string()),
        })?;
        Ok(Bytes::from(data))
    }
}
