//! Storage broker ("Den")
//!
//! One per gallery. Arbitrates between the shared ephemeral cache and the
//! gallery's permanent download directory: which store a page's bytes live
//! in, where new writes go, and lazy promotion from cache to permanent
//! storage when a gallery enters download mode.
//!
//! Permanent filenames encode the page index as a fixed-width, 1-based,
//! zero-padded number plus a format extension; when searching for an
//! existing file each supported extension is tried and the first match wins.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::cache::{CacheKey, PageCache};
use crate::types::{GalleryRef, Mode};
use crate::utils::{SUPPORTED_EXTENSIONS, sanitize_dir_name, sniff_extension};

/// Per-gallery storage broker.
pub struct Den {
    gallery: GalleryRef,
    cache: Arc<PageCache>,
    download_root: PathBuf,
    mode: std::sync::Mutex<Mode>,
    /// Permanent directory once it is known to exist on disk
    dir: tokio::sync::Mutex<Option<PathBuf>>,
}

impl Den {
    /// Create a broker for one gallery. Starts in read mode; the permanent
    /// directory is resolved lazily.
    pub fn new(gallery: GalleryRef, cache: Arc<PageCache>, download_root: impl Into<PathBuf>) -> Self {
        Self {
            gallery,
            cache,
            download_root: download_root.into(),
            mode: std::sync::Mutex::new(Mode::Read),
            dir: tokio::sync::Mutex::new(None),
        }
    }

    fn key(&self, index: usize) -> CacheKey {
        CacheKey::new(self.gallery.id, index)
    }

    fn mode(&self) -> Mode {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Switch the broker's mode. Entering download mode creates the
    /// permanent directory if it does not exist yet.
    pub async fn set_mode(&self, mode: Mode) {
        {
            let mut guard = self.mode.lock().unwrap_or_else(|e| e.into_inner());
            *guard = mode;
        }
        if mode == Mode::Download {
            self.resolve_dir(true).await;
        }
    }

    /// The directory name for this gallery, recorded in the cache so
    /// repeated runs find the same directory even if the title changes.
    async fn dir_name(&self) -> String {
        let blob_name = format!("{}.dirname", self.gallery.id);
        if let Some(recorded) = self.cache.read_blob(&blob_name).await {
            if let Ok(name) = String::from_utf8(recorded) {
                let name = name.trim();
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }

        let label = self
            .gallery
            .title
            .as_deref()
            .map(sanitize_dir_name)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.gallery.token.clone());
        let name = format!("{}-{}", self.gallery.id, label);

        if let Err(e) = self.cache.write_blob(&blob_name, name.as_bytes()).await {
            tracing::warn!(gallery_id = self.gallery.id, error = %e, "failed to record directory name");
        }
        name
    }

    /// Resolve the permanent directory. Returns `None` when it does not
    /// exist and `create` is false (or creation failed).
    pub async fn resolve_dir(&self, create: bool) -> Option<PathBuf> {
        let mut guard = self.dir.lock().await;
        if let Some(dir) = guard.as_ref() {
            return Some(dir.clone());
        }

        let path = self.download_root.join(self.dir_name().await);
        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        if !exists {
            if !create {
                return None;
            }
            if let Err(e) = tokio::fs::create_dir_all(&path).await {
                tracing::error!(
                    gallery_id = self.gallery.id,
                    path = %path.display(),
                    error = %e,
                    "failed to create download directory"
                );
                return None;
            }
        }
        *guard = Some(path.clone());
        Some(path)
    }

    fn page_file_name(index: usize, extension: &str) -> String {
        format!("{:08}.{extension}", index + 1)
    }

    /// Search the permanent directory for this page, trying each supported
    /// extension; first match wins.
    async fn find_file(dir: &Path, index: usize) -> Option<PathBuf> {
        for extension in SUPPORTED_EXTENSIONS {
            let path = dir.join(Self::page_file_name(index, extension));
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some(path);
            }
        }
        None
    }

    /// Whether this page's bytes are retrievable in the current mode.
    ///
    /// In download mode a page that only lives in the ephemeral cache is
    /// promoted to the permanent directory on this call.
    pub async fn contains(&self, index: usize) -> bool {
        match self.mode() {
            Mode::Read => {
                if self.cache.contains(&self.key(index)).await {
                    return true;
                }
                match self.resolve_dir(false).await {
                    Some(dir) => Self::find_file(&dir, index).await.is_some(),
                    None => false,
                }
            }
            Mode::Download => {
                let Some(dir) = self.resolve_dir(true).await else {
                    return false;
                };
                if Self::find_file(&dir, index).await.is_some() {
                    return true;
                }
                self.promote(index).await
            }
        }
    }

    /// Copy a cached page into the permanent directory, picking the
    /// extension from the cached bytes' format. The cache entry is kept.
    async fn promote(&self, index: usize) -> bool {
        let Some(bytes) = self.cache.read(&self.key(index)).await else {
            return false;
        };
        let Some(extension) = sniff_extension(&bytes) else {
            tracing::warn!(
                gallery_id = self.gallery.id,
                index,
                "cached page is not a recognizable image, not promoting"
            );
            return false;
        };
        let Some(dir) = self.resolve_dir(true).await else {
            return false;
        };

        let path = dir.join(Self::page_file_name(index, extension));
        match tokio::fs::write(&path, &bytes).await {
            Ok(()) => {
                tracing::debug!(
                    gallery_id = self.gallery.id,
                    index,
                    path = %path.display(),
                    "promoted page from cache to download directory"
                );
                true
            }
            Err(e) => {
                tracing::warn!(gallery_id = self.gallery.id, index, error = %e, "promotion write failed");
                false
            }
        }
    }

    /// Open a sink for a page's bytes.
    ///
    /// In read mode the sink prefers an already-existing permanent directory
    /// (keeping a fully-downloaded gallery self-consistent) and falls back
    /// to the ephemeral cache; in download mode it always targets the
    /// permanent directory.
    pub async fn open_for_write(&self, index: usize, extension: &str) -> std::io::Result<PageSink> {
        let dir = match self.mode() {
            Mode::Read => self.resolve_dir(false).await,
            Mode::Download => Some(self.resolve_dir(true).await.ok_or_else(|| {
                std::io::Error::other("download directory could not be created")
            })?),
        };

        match dir {
            Some(dir) => {
                // Drop stale variants with a different extension first
                if let Some(stale) = Self::find_file(&dir, index).await {
                    let _ = tokio::fs::remove_file(&stale).await;
                }
                let path = dir.join(Self::page_file_name(index, extension));
                let file = tokio::fs::File::create(&path).await?;
                Ok(PageSink::File { file, path })
            }
            None => Ok(PageSink::Cache {
                cache: self.cache.clone(),
                key: self.key(index),
                buf: Vec::new(),
            }),
        }
    }

    /// Read a page's bytes.
    ///
    /// Read mode prefers the ephemeral cache, then the permanent directory.
    /// Download mode reads the permanent directory only, attempting one
    /// promotion-from-cache retry if the file is momentarily missing.
    pub async fn open_for_read(&self, index: usize) -> Option<Vec<u8>> {
        match self.mode() {
            Mode::Read => {
                if let Some(bytes) = self.cache.read(&self.key(index)).await {
                    return Some(bytes);
                }
                let dir = self.resolve_dir(false).await?;
                let path = Self::find_file(&dir, index).await?;
                tokio::fs::read(&path).await.ok()
            }
            Mode::Download => {
                let dir = self.resolve_dir(true).await?;
                if let Some(path) = Self::find_file(&dir, index).await {
                    return tokio::fs::read(&path).await.ok();
                }
                if !self.promote(index).await {
                    return None;
                }
                let path = Self::find_file(&dir, index).await?;
                tokio::fs::read(&path).await.ok()
            }
        }
    }

    /// Remove a page from both stores. Returns whether anything was deleted.
    pub async fn remove(&self, index: usize) -> bool {
        let mut removed = self.cache.remove(&self.key(index)).await;
        if let Some(dir) = self.resolve_dir(false).await {
            while let Some(path) = Self::find_file(&dir, index).await {
                if tokio::fs::remove_file(&path).await.is_err() {
                    break;
                }
                removed = true;
            }
        }
        removed
    }
}

/// Destination for one page's incoming bytes.
pub enum PageSink {
    /// Streams into a file in the permanent directory
    File {
        /// Open file handle
        file: tokio::fs::File,
        /// Path, kept for cleanup on discard
        path: PathBuf,
    },
    /// Buffers for a single cache insert on commit
    Cache {
        /// Backing cache
        cache: Arc<PageCache>,
        /// Destination key
        key: CacheKey,
        /// Accumulated body
        buf: Vec<u8>,
    },
}

impl PageSink {
    /// Append one body chunk.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        match self {
            PageSink::File { file, .. } => file.write_all(chunk).await,
            PageSink::Cache { buf, .. } => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
        }
    }

    /// Finalize the write. Cache sinks become visible only here, so a page
    /// never reads as present with partial bytes.
    pub async fn commit(self) -> std::io::Result<()> {
        match self {
            PageSink::File { mut file, .. } => file.flush().await,
            PageSink::Cache { cache, key, buf } => cache.write(key, &buf).await,
        }
    }

    /// Abandon the write, removing any partially written file.
    pub async fn discard(self) {
        if let PageSink::File { file, path } = self {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
}
