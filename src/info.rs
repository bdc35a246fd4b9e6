//! Gallery metadata (`SpiderInfo`): persisted, resumable per-gallery state
//!
//! The on-disk format is line-oriented and version-negotiated. Version 2 is
//! current; the legacy version 1 (no `VERSION` line, no per-batch size line)
//! is still readable. The writer always emits version 2 and never writes
//! failed or empty tokens.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::cache::PageCache;
use crate::error::{Error, Result};
use crate::source::{GalleryMetadata, GallerySource};
use crate::types::{GalleryRef, TokenState};

/// Metadata filename inside a gallery's permanent directory
pub const INFO_FILENAME: &str = "gallery.info";
/// Backup copy, read when the main file is unreadable or invalid
pub const INFO_BACKUP_FILENAME: &str = "gallery.info.bak";

const FORMAT_VERSION: u32 = 2;

/// Per-gallery metadata: page count and the per-page token map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpiderInfo {
    /// Last read position, used to resume reading (not downloading)
    pub start_page: usize,
    /// Owning gallery id; a mismatching file on disk is treated as absent
    pub gallery_id: u64,
    /// Owning gallery token; a mismatching file on disk is treated as absent
    pub gallery_token: String,
    /// Total pages, always > 0 once resolved
    pub total_pages: usize,
    /// Number of preview batches the remote exposes
    pub preview_page_count: usize,
    /// Tokens per preview batch; `None` when unknown (legacy files)
    pub preview_per_page: Option<usize>,
    /// Resolved tokens by page index. `Failed` entries are in-memory only
    /// and never persisted.
    pub tokens: BTreeMap<usize, TokenState>,
}

impl SpiderInfo {
    /// The preview batch expected to carry `page`'s token, clamped to the
    /// known batch range. Falls back to batch 0 while the batch size is
    /// still unknown.
    pub fn preview_index_of(&self, page: usize) -> usize {
        match self.preview_per_page {
            Some(per_page) if per_page > 0 => {
                (page / per_page).min(self.preview_page_count.saturating_sub(1))
            }
            _ => 0,
        }
    }

    /// The resolved token for a page, if any.
    pub fn token(&self, page: usize) -> Option<&TokenState> {
        self.tokens.get(&page)
    }

    /// Parse the line-oriented metadata format. Returns `None` for any
    /// unsupported version, malformed field, or non-positive page count.
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let first = lines.next()?;

        let start_page_line = if let Some(version) = first.strip_prefix("VERSION") {
            let version: u32 = version.trim().parse().ok()?;
            if version != FORMAT_VERSION {
                return None;
            }
            lines.next()?
        } else {
            // Legacy version 1: no VERSION line, the first line is startPage
            first
        };
        let legacy = !first.starts_with("VERSION");

        let start_page = usize::from_str_radix(start_page_line.trim(), 16).ok()?;
        let gallery_id: u64 = lines.next()?.trim().parse().ok()?;
        let gallery_token = lines.next()?.trim().to_string();
        let _reserved = lines.next()?; // legacy field, always "1"
        let preview_page_count: usize = lines.next()?.trim().parse().ok()?;

        let preview_per_page = if legacy {
            None
        } else {
            let per_page: usize = lines.next()?.trim().parse().ok()?;
            (per_page > 0).then_some(per_page)
        };

        let total_pages: usize = lines.next()?.trim().parse().ok()?;
        if total_pages == 0 {
            return None;
        }

        let mut tokens = BTreeMap::new();
        for line in lines {
            let mut parts = line.split_whitespace();
            let (Some(index), Some(token)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(index) = index.parse::<usize>() else {
                continue;
            };
            if index >= total_pages || token.is_empty() {
                continue;
            }
            tokens.insert(index, TokenState::Resolved(token.to_string()));
        }

        Some(Self {
            start_page,
            gallery_id,
            gallery_token,
            total_pages,
            preview_page_count,
            preview_per_page,
            tokens,
        })
    }

    /// Serialize in the current (version 2) format, skipping failed tokens.
    pub fn write(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("VERSION{FORMAT_VERSION}\n"));
        out.push_str(&format!("{:08x}\n", self.start_page));
        out.push_str(&format!("{}\n", self.gallery_id));
        out.push_str(&format!("{}\n", self.gallery_token));
        out.push_str("1\n");
        out.push_str(&format!("{}\n", self.preview_page_count));
        out.push_str(&format!("{}\n", self.preview_per_page.unwrap_or(0)));
        out.push_str(&format!("{}\n", self.total_pages));
        for (index, token) in &self.tokens {
            if let TokenState::Resolved(token) = token {
                if !token.is_empty() {
                    out.push_str(&format!("{index} {token}\n"));
                }
            }
        }
        out
    }

    /// Whether this file belongs to the given gallery.
    fn matches(&self, gallery: &GalleryRef) -> bool {
        self.gallery_id == gallery.id && self.gallery_token == gallery.token
    }

    /// Merge one metadata batch into this info, overwriting the gallery-wide
    /// fields and any previously failed tokens. Returns how many token
    /// entries the batch carried.
    pub fn merge_batch(&mut self, batch: &GalleryMetadata, preview_index: usize) -> usize {
        self.total_pages = batch.total_pages;
        self.preview_page_count = batch.preview_page_count;
        if self.preview_per_page.is_none() {
            self.preview_per_page = infer_preview_per_page(&batch.token_entries, preview_index);
        }
        for (index, token) in &batch.token_entries {
            self.tokens
                .insert(*index, TokenState::Resolved(token.clone()));
        }
        batch.token_entries.len()
    }
}

/// Infer how many tokens one preview batch carries from the batch contents.
///
/// For a non-first batch the first entry's page position divided by the
/// batch index gives the batch size; for the first batch it is simply the
/// number of entries.
fn infer_preview_per_page(entries: &[(usize, String)], preview_index: usize) -> Option<usize> {
    if entries.is_empty() {
        return None;
    }
    if preview_index > 0 {
        let first_position = entries[0].0;
        let per_page = first_position / preview_index;
        (per_page > 0).then_some(per_page)
    } else {
        Some(entries.len())
    }
}

fn cache_blob_name(gallery_id: u64) -> String {
    format!("{gallery_id}.info")
}

/// Loads, persists, and remotely refreshes [`SpiderInfo`].
pub struct InfoStore {
    source: Arc<dyn GallerySource>,
    cache: Arc<PageCache>,
}

impl InfoStore {
    /// Create a store over the remote source and the shared metadata cache.
    pub fn new(source: Arc<dyn GallerySource>, cache: Arc<PageCache>) -> Self {
        Self { source, cache }
    }

    /// Load metadata from local storage: the permanent directory first (main
    /// file, then backup), then the ephemeral metadata cache. A copy whose
    /// id/token do not match the requesting gallery is treated as absent.
    pub async fn load(&self, gallery: &GalleryRef, dir: Option<&Path>) -> Option<SpiderInfo> {
        if let Some(dir) = dir {
            for name in [INFO_FILENAME, INFO_BACKUP_FILENAME] {
                if let Ok(text) = tokio::fs::read_to_string(dir.join(name)).await {
                    if let Some(info) = SpiderInfo::parse(&text) {
                        if info.matches(gallery) {
                            return Some(info);
                        }
                        tracing::warn!(
                            gallery_id = gallery.id,
                            file = name,
                            "metadata file belongs to a different gallery, ignoring"
                        );
                    }
                }
            }
        }

        let blob = self.cache.read_blob(&cache_blob_name(gallery.id)).await?;
        let text = String::from_utf8(blob).ok()?;
        let info = SpiderInfo::parse(&text)?;
        info.matches(gallery).then_some(info)
    }

    /// Fetch fresh metadata from the remote service (first preview batch).
    pub async fn fetch_from_remote(&self, gallery: &GalleryRef) -> Result<SpiderInfo> {
        let batch = self.source.fetch_gallery_metadata(gallery, 0).await?;
        if batch.total_pages == 0 {
            return Err(Error::Metadata(format!(
                "gallery {} reported zero pages",
                gallery.id
            )));
        }

        let mut info = SpiderInfo {
            start_page: 0,
            gallery_id: gallery.id,
            gallery_token: gallery.token.clone(),
            total_pages: batch.total_pages,
            preview_page_count: batch.preview_page_count,
            preview_per_page: None,
            tokens: BTreeMap::new(),
        };
        info.merge_batch(&batch, 0);

        tracing::info!(
            gallery_id = gallery.id,
            total_pages = info.total_pages,
            tokens = info.tokens.len(),
            "gallery metadata resolved from remote"
        );
        Ok(info)
    }

    /// Persist metadata to the permanent directory (when one exists) and to
    /// the ephemeral cache. Both writes are best-effort: this is metadata,
    /// not image data, and a miss only costs a future re-derivation.
    pub async fn persist(&self, info: &SpiderInfo, dir: Option<&Path>) {
        let text = info.write();

        if let Some(dir) = dir {
            for name in [INFO_FILENAME, INFO_BACKUP_FILENAME] {
                if let Err(e) = tokio::fs::write(dir.join(name), &text).await {
                    tracing::warn!(
                        gallery_id = info.gallery_id,
                        file = name,
                        error = %e,
                        "failed to persist metadata to download directory"
                    );
                }
            }
        }

        if let Err(e) = self
            .cache
            .write_blob(&cache_blob_name(info.gallery_id), text.as_bytes())
            .await
        {
            tracing::warn!(
                gallery_id = info.gallery_id,
                error = %e,
                "failed to mirror metadata into the ephemeral cache"
            );
        }
    }

    /// Fetch one additional preview batch, merge its tokens into `info`, and
    /// re-persist. Returns how many token entries the batch carried.
    pub async fn resolve_token_batch(
        &self,
        gallery: &GalleryRef,
        info: &mut SpiderInfo,
        preview_index: usize,
        dir: Option<&Path>,
    ) -> Result<usize> {
        let batch = self
            .source
            .fetch_gallery_metadata(gallery, preview_index)
            .await?;
        let merged = info.merge_batch(&batch, preview_index);
        tracing::debug!(
            gallery_id = gallery.id,
            preview_index,
            merged,
            "merged token batch"
        );
        self.persist(info, dir).await;
        Ok(merged)
    }
}
