use std::error::Error;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// An error that happens while resolving an image.
///
/// None of these errors ever escape a single load request. They decide whether the resolver
/// chain moves on to the next stage, or whether the request ends without a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The image was found neither in the store nor at the remote source.
    #[error("not found")]
    NotFound,
    /// The image could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The image could not be fetched due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The image could not be fetched due to another problem, like connection loss, DNS
    /// resolution, or a 5xx server response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// Bytes were present, but they do not form a valid image.
    #[error("malformed: {0}")]
    Malformed(String),
    /// Materializing the image failed to allocate memory.
    #[error("out of memory while materializing image")]
    ResourceExhausted,
    /// A newer request, or a cancellation, made this piece of work obsolete.
    #[error("superseded")]
    Superseded,
    /// An unexpected error, mostly file system access in the durable store.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for LoadError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            _ => Self::from_std_error(err),
        }
    }
}

impl From<reqwest::Error> for LoadError {
    fn from(err: reqwest::Error) -> Self {
        Self::download_error(&err)
    }
}

impl LoadError {
    /// Logs the error and turns it into an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: Error + 'static>(e: E) -> Self {
        let dynerr: &dyn Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        Self::DownloadError(error_string)
    }

    /// Whether this error only signals that the work became obsolete.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded)
    }

    /// A short, stable name for this error used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Timeout(_) => "timeout",
            Self::DownloadError(_) => "downloaderror",
            Self::Malformed(_) => "malformed",
            Self::ResourceExhausted => "oom",
            Self::Superseded => "superseded",
            Self::InternalError => "internal",
        }
    }
}

/// The result of one resolver stage.
pub type LoadResult<T> = Result<T, LoadError>;
