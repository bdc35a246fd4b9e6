//! Live-coordinator registry
//!
//! At most one coordinator exists per gallery at a time. Consumers obtain a
//! reference in read or download mode and must release it; the registry
//! tears the coordinator down when the last reference goes away.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell, broadcast};
use tracing::info;

use crate::cache::PageCache;
use crate::config::Config;
use crate::decode::ImageDecoder;
use crate::error::Result;
use crate::source::GallerySource;
use crate::types::{Event, GalleryRef, Mode};

use super::SpiderQueen;

const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Registry of live per-gallery coordinators.
///
/// Holds the shared page cache and the process-wide event bus; all
/// coordinators it creates publish to the same bus.
pub struct SpiderRegistry {
    config: Arc<Config>,
    source: Arc<dyn GallerySource>,
    image_decoder: Arc<dyn ImageDecoder>,
    cache: Arc<PageCache>,
    event_tx: broadcast::Sender<Event>,
    // One cell per gallery so a coordinator can be started without holding
    // the map lock; galleries must never wait on each other's startup
    queens: Mutex<HashMap<u64, Arc<OnceCell<Arc<SpiderQueen>>>>>,
}

impl SpiderRegistry {
    /// Build a registry, validating the configuration and opening the
    /// shared cache.
    pub async fn new(
        config: Config,
        source: Arc<dyn GallerySource>,
        image_decoder: Arc<dyn ImageDecoder>,
    ) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.storage.download_root).await?;
        let cache = PageCache::new(
            &config.storage.cache_dir,
            config.storage.cache_capacity_bytes,
        )
        .await?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config: Arc::new(config),
            source,
            image_decoder,
            cache,
            event_tx,
            queens: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe to lifecycle events from every coordinator.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Obtain the coordinator for a gallery, starting one if none is live.
    ///
    /// A second download-mode reference to the same gallery is refused with
    /// [`crate::Error::DownloadBusy`]; read-mode references stack freely.
    pub async fn obtain(&self, gallery: GalleryRef, mode: Mode) -> Result<Arc<SpiderQueen>> {
        loop {
            let cell = {
                let mut queens = self.queens.lock().await;
                queens
                    .entry(gallery.id)
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            };

            // The startup metadata fetch runs outside the map lock; only
            // obtains for the same gallery wait on it. A failed start
            // leaves the cell empty for the next obtain to retry.
            let mut starting = false;
            let queen = cell
                .get_or_try_init(|| {
                    starting = true;
                    info!(gallery_id = gallery.id, ?mode, "starting coordinator");
                    SpiderQueen::start(
                        gallery.clone(),
                        mode,
                        self.config.clone(),
                        self.source.clone(),
                        self.image_decoder.clone(),
                        self.cache.clone(),
                        self.event_tx.clone(),
                    )
                })
                .await?
                .clone();

            if !starting {
                queen.adopt(mode).await?;
            }

            // A concurrent last release may have torn this slot out of the
            // map while no lock was held, which makes the reference above
            // point at a coordinator being shut down. Re-check the slot and
            // retry on a fresh one.
            {
                let queens = self.queens.lock().await;
                if queens
                    .get(&gallery.id)
                    .is_some_and(|current| Arc::ptr_eq(current, &cell))
                {
                    return Ok(queen);
                }
            }
            if queen.release_ref(mode).await {
                queen.shutdown().await;
            }
        }
    }

    /// Release one reference to a coordinator. The last release shuts the
    /// coordinator down and drops it from the registry.
    pub async fn release(&self, queen: &Arc<SpiderQueen>, mode: Mode) {
        let mut queens = self.queens.lock().await;
        if queen.release_ref(mode).await {
            let id = queen.gallery().id;
            // Only evict the slot if it still holds this coordinator
            if queens
                .get(&id)
                .and_then(|cell| cell.get())
                .is_some_and(|current| Arc::ptr_eq(current, queen))
            {
                queens.remove(&id);
            }
            queen.shutdown().await;
        }
    }

    /// Whether a coordinator is currently live for this gallery.
    pub async fn is_live(&self, gallery_id: u64) -> bool {
        self.queens
            .lock()
            .await
            .get(&gallery_id)
            .is_some_and(|cell| cell.initialized())
    }
}
