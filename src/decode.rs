//! Image decoding seam
//!
//! Only the invocation point lives here: the codec itself is behind the
//! [`ImageDecoder`] trait, with a production implementation backed by the
//! `image` crate running on the blocking pool.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::PageError;

/// Abstraction over the image codec, enabling testability.
#[async_trait]
pub trait ImageDecoder: Send + Sync {
    /// Decode stored page bytes into an in-memory image.
    async fn decode(&self, bytes: Vec<u8>) -> Result<Arc<image::DynamicImage>, PageError>;
}

/// Production decoder using the `image` crate.
///
/// Decoding is CPU-bound, so it runs via `spawn_blocking` to keep worker
/// and decoder tasks responsive.
pub struct DynamicImageDecoder;

#[async_trait]
impl ImageDecoder for DynamicImageDecoder {
    async fn decode(&self, bytes: Vec<u8>) -> Result<Arc<image::DynamicImage>, PageError> {
        let decoded = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .map_err(|e| PageError::Decode(format!("decode task panicked: {e}")))?
            .map_err(|e| PageError::Decode(e.to_string()))?;
        Ok(Arc::new(decoded))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn one_pixel_png() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([10, 20, 30, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn decodes_valid_png_bytes() {
        let decoder = DynamicImageDecoder;
        let image = decoder.decode(one_pixel_png()).await.unwrap();
        assert_eq!(image.width(), 1);
        assert_eq!(image.height(), 1);
    }

    #[tokio::test]
    async fn garbage_bytes_fail_with_decode_error() {
        let decoder = DynamicImageDecoder;
        let err = decoder.decode(b"not an image".to_vec()).await.unwrap_err();
        assert!(matches!(err, PageError::Decode(_)));
    }
}
