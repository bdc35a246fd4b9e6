//! Shared ephemeral page cache
//!
//! A process-wide, size-bounded, disk-backed store for transiently viewed
//! page bytes, keyed by `(gallery_id, page_index)`. Least-recently-used
//! entries are evicted when a write pushes the cache over capacity. Eviction
//! never touches permanent directories.
//!
//! Small named blobs (gallery metadata mirrors, resolved directory names)
//! are stored alongside the page entries and are not counted against the
//! size bound.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;

/// Key of one cached page
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Owning gallery
    pub gallery_id: u64,
    /// Page index within the gallery
    pub index: usize,
}

impl CacheKey {
    /// Create a key for one gallery page.
    pub fn new(gallery_id: u64, index: usize) -> Self {
        Self { gallery_id, index }
    }

    fn file_name(&self) -> String {
        format!("{}-{}", self.gallery_id, self.index)
    }

    fn parse(name: &str) -> Option<Self> {
        let (gallery, index) = name.split_once('-')?;
        Some(Self {
            gallery_id: gallery.parse().ok()?,
            index: index.parse().ok()?,
        })
    }
}

struct CacheEntry {
    size: u64,
    last_used: u64,
}

struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    total: u64,
    tick: u64,
}

impl CacheInner {
    fn touch(&mut self, key: &CacheKey) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_used = tick;
        }
    }

    /// Keys to evict so that `total` drops to `capacity` or below,
    /// least-recently-used first. `keep` is never selected.
    fn eviction_victims(&self, capacity: u64, keep: &CacheKey) -> Vec<CacheKey> {
        let mut candidates: Vec<(CacheKey, u64, u64)> = self
            .entries
            .iter()
            .filter(|(k, _)| *k != keep)
            .map(|(k, e)| (*k, e.last_used, e.size))
            .collect();
        candidates.sort_by_key(|(_, last_used, _)| *last_used);

        let mut victims = Vec::new();
        let mut total = self.total;
        for (key, _, size) in candidates {
            if total <= capacity {
                break;
            }
            total = total.saturating_sub(size);
            victims.push(key);
        }
        victims
    }
}

/// Shared, size-bounded ephemeral store for page bytes.
pub struct PageCache {
    root: PathBuf,
    capacity: u64,
    inner: tokio::sync::Mutex<CacheInner>,
}

impl PageCache {
    /// Open (or create) the cache directory and rebuild the index from the
    /// files already on disk.
    pub async fn new(root: impl Into<PathBuf>, capacity: u64) -> Result<Arc<Self>> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut entries = HashMap::new();
        let mut total = 0u64;
        let mut dir = tokio::fs::read_dir(&root).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(key) = CacheKey::parse(name) else {
                continue; // named blob or foreign file
            };
            let size = item.metadata().await.map(|m| m.len()).unwrap_or(0);
            total += size;
            entries.insert(key, CacheEntry { size, last_used: 0 });
        }

        tracing::debug!(
            entries = entries.len(),
            total_bytes = total,
            capacity_bytes = capacity,
            "page cache opened"
        );

        Ok(Arc::new(Self {
            root,
            capacity,
            inner: tokio::sync::Mutex::new(CacheInner {
                entries,
                total,
                tick: 0,
            }),
        }))
    }

    fn page_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// Whether the cache holds bytes for this page.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().await.entries.contains_key(key)
    }

    /// Read a page's bytes, refreshing its recency. A missing or unreadable
    /// file drops the index entry and reads as absent.
    pub async fn read(&self, key: &CacheKey) -> Option<Vec<u8>> {
        {
            let mut inner = self.inner.lock().await;
            if !inner.entries.contains_key(key) {
                return None;
            }
            inner.touch(key);
        }

        match tokio::fs::read(self.page_path(key)).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(
                    gallery_id = key.gallery_id,
                    index = key.index,
                    error = %e,
                    "cached page unreadable, dropping index entry"
                );
                let mut inner = self.inner.lock().await;
                if let Some(entry) = inner.entries.remove(key) {
                    inner.total = inner.total.saturating_sub(entry.size);
                }
                None
            }
        }
    }

    /// Store a page's bytes, evicting least-recently-used entries if the
    /// write pushes the cache over capacity.
    pub async fn write(&self, key: CacheKey, bytes: &[u8]) -> std::io::Result<()> {
        tokio::fs::write(self.page_path(&key), bytes).await?;

        let victims = {
            let mut inner = self.inner.lock().await;
            if let Some(old) = inner.entries.remove(&key) {
                inner.total = inner.total.saturating_sub(old.size);
            }
            inner.tick += 1;
            let tick = inner.tick;
            inner.entries.insert(
                key,
                CacheEntry {
                    size: bytes.len() as u64,
                    last_used: tick,
                },
            );
            inner.total += bytes.len() as u64;
            let victims = inner.eviction_victims(self.capacity, &key);
            for victim in &victims {
                if let Some(entry) = inner.entries.remove(victim) {
                    inner.total = inner.total.saturating_sub(entry.size);
                }
            }
            victims
        };

        for victim in victims {
            tracing::debug!(
                gallery_id = victim.gallery_id,
                index = victim.index,
                "evicting page from ephemeral cache"
            );
            if let Err(e) = tokio::fs::remove_file(self.page_path(&victim)).await {
                tracing::warn!(error = %e, "failed to remove evicted cache file");
            }
        }

        Ok(())
    }

    /// Remove a page. Returns whether an entry was actually deleted.
    pub async fn remove(&self, key: &CacheKey) -> bool {
        let had_entry = {
            let mut inner = self.inner.lock().await;
            match inner.entries.remove(key) {
                Some(entry) => {
                    inner.total = inner.total.saturating_sub(entry.size);
                    true
                }
                None => false,
            }
        };
        let removed_file = tokio::fs::remove_file(self.page_path(key)).await.is_ok();
        had_entry || removed_file
    }

    /// Read a named blob (metadata mirror, directory-name record).
    pub async fn read_blob(&self, name: &str) -> Option<Vec<u8>> {
        tokio::fs::read(self.root.join(name)).await.ok()
    }

    /// Write a named blob. Blobs are not counted against the size bound.
    pub async fn write_blob(&self, name: &str, bytes: &[u8]) -> std::io::Result<()> {
        tokio::fs::write(self.root.join(name), bytes).await
    }

    /// Current total size of tracked page entries in bytes.
    pub async fn total_bytes(&self) -> u64 {
        self.inner.lock().await.total
    }
}
