//! Fetchers which retrieve the raw bytes of an image from where it is hosted.
//!
//! A fetcher is pure I/O: it knows nothing about caching, retries or who asked for the image.
//! Failures are reported as a [`LoadError`] and end the load request that triggered the fetch.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;

use crate::caching::{LoadError, LoadResult, ResourceKey};

mod filesystem;
mod http;

pub use filesystem::FilesystemFetcher;
pub use http::HttpFetcher;

const USER_AGENT: &str = concat!("pixcache/", env!("CARGO_PKG_VERSION"));

/// Retrieves the raw bytes of an image.
#[async_trait]
pub trait Fetcher: fmt::Debug + Send + Sync + 'static {
    /// Fetches the bytes for `key`.
    async fn fetch(&self, key: &ResourceKey) -> LoadResult<Bytes>;
}

/// Maps an unsuccessful HTTP status to a [`LoadError`].
fn error_for_status(key: &ResourceKey, status: StatusCode) -> LoadError {
    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to download `{key}`: {status}");
        LoadError::PermissionDenied(status.to_string())
    } else if status == StatusCode::NOT_FOUND {
        tracing::debug!("Image `{key}` not found at source: {status}");
        LoadError::NotFound
    } else {
        tracing::debug!("Unexpected status code from source for `{key}`: {status}");
        LoadError::DownloadError(status.to_string())
    }
}
