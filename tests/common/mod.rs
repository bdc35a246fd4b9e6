//! Shared scaffolding for integration tests: a scriptable gallery source
//! built on the public API, plus config helpers.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use spider_dl::{
    BackoffConfig, ByteResponse, Config, GalleryMetadata, GalleryRef, PageApi, PageHtml,
    SourceError, SpiderConfig, StorageConfig,
};

pub const SHOW_KEY: &str = "showkey-1";

/// A 1x1 PNG, decodable by the production decoder.
pub fn png_bytes() -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([9, 8, 7, 255]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Config rooted in a temp directory with near-zero backoff delays.
pub fn test_config(root: &Path) -> Config {
    Config {
        spider: SpiderConfig {
            workers: 2,
            decoders: 1,
            preload_window: 3,
            attempt_budget: 3,
            token_failure_budget: 2,
        },
        storage: StorageConfig {
            download_root: root.join("downloads"),
            cache_dir: root.join("cache"),
            cache_capacity_bytes: 8 * 1024 * 1024,
        },
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
            jitter: false,
        },
    }
}

/// Scriptable gallery source for integration tests.
///
/// Pages resolve to `mock://image/{index}` and serve a real PNG body;
/// individual pages can be scripted to stall forever, for cancellation
/// tests.
pub struct ScriptedSource {
    total_pages: usize,
    per_batch: usize,
    body: Vec<u8>,
    /// Pages whose byte fetch never completes
    stalled_pages: Mutex<HashSet<usize>>,
    pub byte_calls: AtomicU32,
    pub html_calls: AtomicU32,
    pub api_calls: AtomicU32,
    pub metadata_calls: AtomicU32,
}

impl ScriptedSource {
    pub fn new(total_pages: usize) -> Self {
        Self {
            total_pages,
            per_batch: 20,
            body: png_bytes(),
            stalled_pages: Mutex::new(HashSet::new()),
            byte_calls: AtomicU32::new(0),
            html_calls: AtomicU32::new(0),
            api_calls: AtomicU32::new(0),
            metadata_calls: AtomicU32::new(0),
        }
    }

    pub fn stall_page(&self, index: usize) {
        self.stalled_pages.lock().unwrap().insert(index);
    }

    pub fn token_for(index: usize) -> String {
        format!("ptok-{index}")
    }

    fn index_from_url(url: &str) -> Option<usize> {
        url.strip_prefix("mock://image/")?.parse().ok()
    }
}

#[async_trait]
impl spider_dl::GallerySource for ScriptedSource {
    async fn fetch_gallery_metadata(
        &self,
        _gallery: &GalleryRef,
        preview_index: usize,
    ) -> Result<GalleryMetadata, SourceError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let start = preview_index * self.per_batch;
        let end = (start + self.per_batch).min(self.total_pages);
        Ok(GalleryMetadata {
            title: Some("Scripted Gallery".to_string()),
            total_pages: self.total_pages,
            preview_page_count: self.total_pages.div_ceil(self.per_batch),
            token_entries: (start..end).map(|i| (i, Self::token_for(i))).collect(),
        })
    }

    async fn fetch_page_html(
        &self,
        _gallery: &GalleryRef,
        index: usize,
        token: &str,
        _skip_key: Option<&str>,
    ) -> Result<PageHtml, SourceError> {
        self.html_calls.fetch_add(1, Ordering::SeqCst);
        if token != Self::token_for(index) {
            return Err(SourceError::Parse(format!("bad token for page {index}")));
        }
        Ok(PageHtml {
            image_url: format!("mock://image/{index}"),
            origin_image_url: None,
            show_key: SHOW_KEY.to_string(),
            skip_key: None,
        })
    }

    async fn fetch_page_api(
        &self,
        _gallery: &GalleryRef,
        index: usize,
        token: &str,
        show_key: &str,
        _previous_token: Option<&str>,
    ) -> Result<PageApi, SourceError> {
        self.api_calls.fetch_add(1, Ordering::SeqCst);
        if show_key != SHOW_KEY {
            return Err(SourceError::KeyMismatch);
        }
        if token != Self::token_for(index) {
            return Err(SourceError::Parse(format!("bad token for page {index}")));
        }
        Ok(PageApi {
            image_url: format!("mock://image/{index}"),
            origin_image_url: None,
            skip_key: None,
        })
    }

    async fn fetch_bytes(
        &self,
        url: &str,
        _referer: Option<&str>,
    ) -> Result<ByteResponse, SourceError> {
        self.byte_calls.fetch_add(1, Ordering::SeqCst);
        let index =
            Self::index_from_url(url).ok_or_else(|| SourceError::InvalidUrl(url.to_string()))?;

        let body = self.body.clone();
        let mid = body.len() / 2;
        let head = Bytes::copy_from_slice(&body[..mid]);
        let tail = Bytes::copy_from_slice(&body[mid..]);

        if self.stalled_pages.lock().unwrap().contains(&index) {
            // First chunk arrives, then the stream hangs until cancellation
            let stream = futures::stream::once(async move { Ok(head) })
                .chain(futures::stream::pending());
            return Ok(ByteResponse {
                status: 200,
                content_type: Some("image/png".to_string()),
                content_length: Some(body.len() as u64),
                stream: Box::pin(stream),
            });
        }

        let stream = futures::stream::iter(vec![Ok(head), Ok(tail)]);
        Ok(ByteResponse {
            status: 200,
            content_type: Some("image/png".to_string()),
            content_length: Some(body.len() as u64),
            stream: Box::pin(stream),
        })
    }
}
