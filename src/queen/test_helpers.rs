//! Shared scaffolding for coordinator unit tests: a scriptable
//! [`GallerySource`] with failure injection, plus config and fixture
//! helpers.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{BackoffConfig, Config, SpiderConfig, StorageConfig};
use crate::source::{
    ByteResponse, GalleryMetadata, GallerySource, PageApi, PageHtml, SourceError,
};
use crate::types::GalleryRef;

pub(crate) const SHOW_KEY: &str = "showkey-1";

/// A 1x1 PNG, decodable by the production decoder.
pub(crate) fn png_bytes() -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([1, 2, 3, 255]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Config rooted in a temp directory with near-zero backoff delays.
pub(crate) fn test_config(root: &Path) -> Config {
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

/// Scriptable gallery source.
///
/// Pages resolve to `mock://image/{index}` and serve a real PNG body by
/// default; individual pages and call sites can be scripted to fail.
pub(crate) struct MockSource {
    total_pages: usize,
    per_batch: usize,
    body: Vec<u8>,

    /// Fail the next N metadata-batch fetches with a network error
    metadata_failures: AtomicU32,
    /// Answer the next N API fetches with a show-key mismatch
    key_mismatches: AtomicU32,
    /// Pages whose HTML fetch is rate limited
    rate_limited_pages: Mutex<HashSet<usize>>,
    /// Pages whose byte fetch serves an HTML block page
    text_body_pages: Mutex<HashSet<usize>>,
    /// Remaining injected network failures per page's HTML fetch
    html_failures: Mutex<HashMap<usize, u32>>,
    /// Galleries whose metadata fetch never completes
    stalled_metadata: Mutex<HashSet<u64>>,

    pub(crate) metadata_calls: AtomicU32,
    pub(crate) html_calls: AtomicU32,
    pub(crate) api_calls: AtomicU32,
    pub(crate) byte_calls: AtomicU32,
}

impl MockSource {
    pub(crate) fn new(total_pages: usize) -> Self {
        Self {
            total_pages,
            per_batch: 20,
            body: png_bytes(),
            metadata_failures: AtomicU32::new(0),
            key_mismatches: AtomicU32::new(0),
            rate_limited_pages: Mutex::new(HashSet::new()),
            text_body_pages: Mutex::new(HashSet::new()),
            html_failures: Mutex::new(HashMap::new()),
            stalled_metadata: Mutex::new(HashSet::new()),
            metadata_calls: AtomicU32::new(0),
            html_calls: AtomicU32::new(0),
            api_calls: AtomicU32::new(0),
            byte_calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn with_batch_size(mut self, per_batch: usize) -> Self {
        self.per_batch = per_batch;
        self
    }

    pub(crate) fn fail_metadata(&self, times: u32) {
        self.metadata_failures.store(times, Ordering::SeqCst);
    }

    pub(crate) fn mismatch_keys(&self, times: u32) {
        self.key_mismatches.store(times, Ordering::SeqCst);
    }

    pub(crate) fn rate_limit_page(&self, index: usize) {
        self.rate_limited_pages.lock().unwrap().insert(index);
    }

    pub(crate) fn serve_text_body(&self, index: usize) {
        self.text_body_pages.lock().unwrap().insert(index);
    }

    pub(crate) fn fail_html(&self, index: usize, times: u32) {
        self.html_failures.lock().unwrap().insert(index, times);
    }

    pub(crate) fn stall_metadata(&self, gallery_id: u64) {
        self.stalled_metadata.lock().unwrap().insert(gallery_id);
    }

    pub(crate) fn token_for(index: usize) -> String {
        format!("ptok-{index}")
    }

    fn index_from_url(url: &str) -> Option<usize> {
        url.strip_prefix("mock://image/")?.parse().ok()
    }
}

#[async_trait]
impl GallerySource for MockSource {
    async fn fetch_gallery_metadata(
        &self,
        gallery: &GalleryRef,
        preview_index: usize,
    ) -> Result<GalleryMetadata, SourceError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if self.stalled_metadata.lock().unwrap().contains(&gallery.id) {
            futures::future::pending::<()>().await;
        }
        if self
            .metadata_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SourceError::Network("injected metadata failure".into()));
        }

        let start = preview_index * self.per_batch;
        let end = (start + self.per_batch).min(self.total_pages);
        Ok(GalleryMetadata {
            title: Some("Mock Gallery".to_string()),
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

        if self.rate_limited_pages.lock().unwrap().contains(&index) {
            return Err(SourceError::RateLimited);
        }
        if let Some(remaining) = self.html_failures.lock().unwrap().get_mut(&index) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SourceError::Network("injected html failure".into()));
            }
        }
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

        if self
            .key_mismatches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SourceError::KeyMismatch);
        }
        if show_key != SHOW_KEY {
            return Err(SourceError::KeyMismatch);
        }
        if self.rate_limited_pages.lock().unwrap().contains(&index) {
            return Err(SourceError::RateLimited);
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

        let (body, content_type) = if self.text_body_pages.lock().unwrap().contains(&index) {
            (
                b"<html>temporarily blocked</html>".to_vec(),
                "text/html".to_string(),
            )
        } else {
            (self.body.clone(), "image/png".to_string())
        };

        // Two chunks so progress reporting sees more than one update
        let mid = body.len() / 2;
        let chunks = vec![
            Ok(Bytes::copy_from_slice(&body[..mid])),
            Ok(Bytes::copy_from_slice(&body[mid..])),
        ];
        Ok(ByteResponse {
            status: 200,
            content_type: Some(content_type),
            content_length: Some(body.len() as u64),
            stream: Box::pin(futures::stream::iter(chunks)),
        })
    }
}
