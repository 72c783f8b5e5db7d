//! Turning raw bytes into images that can be cached and displayed.

use std::fmt;
use std::io::Cursor;

use bytes::Bytes;
use image::{DynamicImage, ImageError, ImageReader, Limits};

use crate::caching::{LoadError, LoadResult};

/// Turns raw bytes into a resource, and measures resources for the in-memory byte budget.
pub trait Decoder: Send + Sync + 'static {
    /// The decoded resource.
    type Resource: Send + Sync + 'static;

    /// Decodes `bytes`.
    ///
    /// Invalid bytes are reported as [`LoadError::Malformed`], failing to allocate memory for the
    /// decoded resource as [`LoadError::ResourceExhausted`].
    fn decode(&self, bytes: Bytes) -> LoadResult<Self::Resource>;

    /// The number of bytes `resource` occupies in memory.
    fn size_of(&self, resource: &Self::Resource) -> u64;
}

/// The container format an [`Image`] was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    WebP,
}

impl ImageFormat {
    fn from_detected(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Png => Some(Self::Png),
            image::ImageFormat::Jpeg => Some(Self::Jpeg),
            image::ImageFormat::Gif => Some(Self::Gif),
            image::ImageFormat::WebP => Some(Self::WebP),
            _ => None,
        }
    }
}

impl AsRef<str> for ImageFormat {
    fn as_ref(&self) -> &str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Gif => "gif",
            Self::WebP => "webp",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// A decoded image.
#[derive(Clone, PartialEq)]
pub struct Image {
    pub format: ImageFormat,
    pixels: DynamicImage,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("format", &self.format)
            .field("dimensions", &self.dimensions())
            .field("color", &self.pixels.color())
            .finish()
    }
}

impl Image {
    /// Width and height in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.pixels.width(), self.pixels.height())
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    /// The size of the pixel buffer, `width * height * bytes_per_pixel`.
    pub fn byte_size(&self) -> u64 {
        self.pixels.as_bytes().len() as u64
    }
}

/// The default [`Decoder`], decoding PNG, JPEG, GIF and WebP images with the `image` crate.
#[derive(Debug, Clone, Default)]
pub struct ImageDecoder {
    /// Overrides the allocation limit of the `image` crate.
    max_decoded_size: Option<u64>,
}

impl ImageDecoder {
    pub fn new(max_decoded_size: Option<u64>) -> Self {
        Self { max_decoded_size }
    }

    fn limits(&self) -> Limits {
        let mut limits = Limits::default();
        if let Some(max) = self.max_decoded_size {
            limits.max_alloc = Some(max);
        }
        limits
    }
}

impl Decoder for ImageDecoder {
    type Resource = Image;

    fn decode(&self, bytes: Bytes) -> LoadResult<Image> {
        let mut reader = ImageReader::new(Cursor::new(&bytes[..]))
            .with_guessed_format()
            .map_err(|err| LoadError::Malformed(err.to_string()))?;

        let format = reader
            .format()
            .and_then(ImageFormat::from_detected)
            .ok_or_else(|| LoadError::Malformed("unknown image format".into()))?;

        reader.limits(self.limits());
        let pixels = reader.decode().map_err(|err| match err {
            ImageError::Limits(_) => LoadError::ResourceExhausted,
            err => LoadError::Malformed(format!("invalid {format}: {err}")),
        })?;

        Ok(Image { format, pixels })
    }

    fn size_of(&self, image: &Image) -> u64 {
        image.byte_size()
    }
}
