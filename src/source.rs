//! Remote service boundary
//!
//! The raw transport and the site-specific response parsers live behind the
//! [`GallerySource`] trait: implementations fetch and parse, the rest of the
//! crate only sees the parsed structs. A production [`HttpFetcher`] is
//! provided for the streaming byte-fetch half, which is site-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use std::pin::Pin;
use thiserror::Error;
use url::Url;

use crate::types::GalleryRef;

/// Errors produced at the remote boundary
#[derive(Debug, Error)]
pub enum SourceError {
    /// The remote answered with its distinguished back-off response.
    /// Terminal for the current page attempt, no fallback.
    #[error("rate limited by remote service")]
    RateLimited,

    /// The lightweight API fetch rejected the cached show key. The caller
    /// must re-derive the key from an HTML fetch; this does not consume a
    /// content-fetch attempt.
    #[error("show key mismatch")]
    KeyMismatch,

    /// Transport-level failure
    #[error("network error: {0}")]
    Network(String),

    /// The response body could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// The URL was malformed
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        SourceError::Network(e.to_string())
    }
}

/// Parsed gallery metadata response: one preview batch worth of tokens
/// plus the gallery-level fields.
#[derive(Clone, Debug)]
pub struct GalleryMetadata {
    /// Gallery title, when the response carries one
    pub title: Option<String>,
    /// Total number of pages in the gallery (must be > 0)
    pub total_pages: usize,
    /// Number of preview batches the remote exposes
    pub preview_page_count: usize,
    /// `(page_index, token)` entries bundled in this batch, in page order
    pub token_entries: Vec<(usize, String)>,
}

/// Parsed page HTML view
#[derive(Clone, Debug)]
pub struct PageHtml {
    /// Resolved image URL
    pub image_url: String,
    /// Direct full-resolution URL, when offered
    pub origin_image_url: Option<String>,
    /// Session show key authorizing lightweight API fetches
    pub show_key: String,
    /// Skip key to carry into the next fetch for this page
    pub skip_key: Option<String>,
}

/// Parsed lightweight API response
#[derive(Clone, Debug)]
pub struct PageApi {
    /// Resolved image URL
    pub image_url: String,
    /// Direct full-resolution URL, when offered
    pub origin_image_url: Option<String>,
    /// Skip key to carry into the next fetch for this page
    pub skip_key: Option<String>,
}

/// Streaming chunks of an image body
pub type BytesStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Bytes, SourceError>> + Send>>;

/// A raw byte-fetch response
pub struct ByteResponse {
    /// HTTP status code
    pub status: u16,
    /// `Content-Type` header value, when present
    pub content_type: Option<String>,
    /// `Content-Length` header value, when present
    pub content_length: Option<u64>,
    /// Body chunks
    pub stream: BytesStream,
}

impl std::fmt::Debug for ByteResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Abstraction over the remote gallery service, enabling testability.
///
/// Implementations own URL construction and response parsing; the
/// orchestration code only consumes the parsed structs.
#[async_trait]
pub trait GallerySource: Send + Sync {
    /// Fetch one metadata/preview batch keyed by `preview_index`.
    async fn fetch_gallery_metadata(
        &self,
        gallery: &GalleryRef,
        preview_index: usize,
    ) -> Result<GalleryMetadata, SourceError>;

    /// Fetch the page's HTML view to derive its image URL and show key.
    async fn fetch_page_html(
        &self,
        gallery: &GalleryRef,
        index: usize,
        token: &str,
        skip_key: Option<&str>,
    ) -> Result<PageHtml, SourceError>;

    /// Lightweight API fetch authorized by a show key. The remote requires
    /// the previous page's token as proof of sequential access.
    async fn fetch_page_api(
        &self,
        gallery: &GalleryRef,
        index: usize,
        token: &str,
        show_key: &str,
        previous_token: Option<&str>,
    ) -> Result<PageApi, SourceError>;

    /// Stream the bytes behind a resolved image URL.
    async fn fetch_bytes(
        &self,
        url: &str,
        referer: Option<&str>,
    ) -> Result<ByteResponse, SourceError>;
}

/// Production streaming byte fetcher backed by reqwest.
///
/// `GallerySource` implementations embed this for their `fetch_bytes` half;
/// the parsed-response halves remain site-specific.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a fetcher with the given request timeout.
    pub fn new(timeout: std::time::Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Issue a streaming GET for an image URL.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        referer: Option<&str>,
    ) -> Result<ByteResponse, SourceError> {
        let url = Url::parse(url).map_err(|e| SourceError::InvalidUrl(e.to_string()))?;

        let mut request = self.client.get(url);
        if let Some(referer) = referer {
            request = request.header(reqwest::header::REFERER, referer);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_length = response.content_length();

        let stream = response
            .bytes_stream()
            .map_err(|e| SourceError::Network(e.to_string()));

        Ok(ByteResponse {
            status,
            content_type,
            content_length,
            stream: Box::pin(stream),
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_bytes_rejects_malformed_url() {
        let fetcher = HttpFetcher::new(std::time::Duration::from_secs(5)).unwrap();
        let err = fetcher.fetch_bytes("not a url", None).await.unwrap_err();
        assert!(
            matches!(err, SourceError::InvalidUrl(_)),
            "malformed URL must fail before any network I/O, got: {err:?}"
        );
    }

    #[test]
    fn rate_limit_and_key_mismatch_are_distinguished() {
        assert!(matches!(SourceError::RateLimited, SourceError::RateLimited));
        assert_ne!(
            SourceError::RateLimited.to_string(),
            SourceError::KeyMismatch.to_string()
        );
    }
}
