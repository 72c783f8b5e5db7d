//! Support to download images from an HTTP image server.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Url, header};

use crate::caching::{LoadError, LoadResult, ResourceKey};
use crate::utils::http::DownloadTimeouts;

use super::{Fetcher, USER_AGENT, error_for_status};

/// Fetcher implementation that downloads images from an HTTP image server.
///
/// An image is requested as `<base_url>/image?name=<key>`, whether or not the path of the base
/// URL ends with a slash.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    base_url: Url,
    timeouts: DownloadTimeouts,
}

impl HttpFetcher {
    pub fn new(client: Client, mut base_url: Url, timeouts: DownloadTimeouts) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Self {
            client,
            base_url,
            timeouts,
        }
    }

    /// Returns the URL an image is downloaded from.
    pub fn image_url(&self, key: &ResourceKey) -> LoadResult<Url> {
        let mut url = self
            .base_url
            .join("image")
            .map_err(|e| LoadError::DownloadError(e.to_string()))?;
        url.query_pairs_mut().append_pair("name", key.as_str());
        Ok(url)
    }

    fn timeout_error(&self) -> LoadError {
        LoadError::Timeout(self.timeouts.max_download)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, key: &ResourceKey) -> LoadResult<Bytes> {
        let url = self.image_url(key)?;
        tracing::debug!("Fetching image from `{}`", url);

        let response = self
            .client
            .get(url)
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|e| match e.is_timeout() {
                true => self.timeout_error(),
                false => e.into(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_for_status(key, status));
        }

        let body = response.bytes().await.map_err(|e| match e.is_timeout() {
            true => self.timeout_error(),
            false => e.into(),
        })?;

        if body.is_empty() {
            tracing::debug!("Source returned an empty body for `{key}`");
            return Err(LoadError::NotFound);
        }

        Ok(body)
    }
}
