//! Per-gallery coordinator ("Queen") and its pools, split into focused
//! submodules:
//! - [`registry`] - live-coordinator registry and reference counting
//! - [`state`] - page-state table and request queues
//! - [`resolver`] - the dedicated token-resolution loop
//! - [`worker`] - the download worker pool
//! - [`decoder`] - the decode pool

mod decoder;
mod registry;
mod resolver;
mod state;
mod worker;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use registry::SpiderRegistry;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Notify, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::cache::PageCache;
use crate::config::Config;
use crate::decode::ImageDecoder;
use crate::den::Den;
use crate::error::{Error, PageError, Result};
use crate::info::{InfoStore, SpiderInfo};
use crate::source::GallerySource;
use crate::types::{
    Event, GalleryRef, Mode, ModeRefs, PageCounters, PageState, PageStatus, TokenState,
};

/// One live coordinator per gallery.
///
/// Owns the page-state table, the request queues, the token-resolution loop,
/// and supervises the worker and decoder pools. Obtained through
/// [`SpiderRegistry::obtain`] and reference-counted across consumers; the
/// last [`SpiderRegistry::release`] cancels everything.
pub struct SpiderQueen {
    gallery: GalleryRef,
    pub(crate) config: Arc<Config>,
    pub(crate) source: Arc<dyn GallerySource>,
    pub(crate) image_decoder: Arc<dyn ImageDecoder>,
    event_tx: broadcast::Sender<Event>,
    pub(crate) den: Arc<Den>,
    pub(crate) info_store: Arc<InfoStore>,
    /// Persisted metadata, including the token map
    pub(crate) info: tokio::sync::Mutex<SpiderInfo>,
    /// Lock order: `table` before `queues` whenever both are taken
    pub(crate) table: tokio::sync::Mutex<state::PageTable>,
    pub(crate) queues: tokio::sync::Mutex<state::RequestQueues>,
    refs: tokio::sync::Mutex<ModeRefs>,
    /// Session show key shared across this gallery's pages
    pub(crate) show_key: tokio::sync::Mutex<Option<String>>,
    token_tx: mpsc::UnboundedSender<usize>,
    pub(crate) token_notify: Notify,
    decode_tx: mpsc::UnboundedSender<usize>,
    decode_inflight: tokio::sync::Mutex<HashSet<usize>>,
    /// Pages whose decode is deferred until a re-download completes
    redecode: tokio::sync::Mutex<HashSet<usize>>,
    decoded: tokio::sync::Mutex<HashMap<usize, Arc<image::DynamicImage>>>,
    live_workers: AtomicUsize,
    pub(crate) cancel: CancellationToken,
}

impl std::fmt::Debug for SpiderQueen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpiderQueen").finish_non_exhaustive()
    }
}

impl SpiderQueen {
    /// Construct a coordinator for one gallery and start its loops.
    ///
    /// Metadata comes from local storage when a valid copy exists, otherwise
    /// from the remote service (and is persisted immediately).
    pub(crate) async fn start(
        gallery: GalleryRef,
        mode: Mode,
        config: Arc<Config>,
        source: Arc<dyn GallerySource>,
        image_decoder: Arc<dyn ImageDecoder>,
        cache: Arc<PageCache>,
        event_tx: broadcast::Sender<Event>,
    ) -> Result<Arc<Self>> {
        let den = Arc::new(Den::new(
            gallery.clone(),
            cache.clone(),
            config.storage.download_root.clone(),
        ));
        let info_store = Arc::new(InfoStore::new(source.clone(), cache));

        let dir = den.resolve_dir(false).await;
        let info = match info_store.load(&gallery, dir.as_deref()).await {
            Some(info) => {
                tracing::debug!(gallery_id = gallery.id, "metadata loaded from local storage");
                info
            }
            None => {
                let info = info_store.fetch_from_remote(&gallery).await?;
                info_store.persist(&info, dir.as_deref()).await;
                info
            }
        };
        let total_pages = info.total_pages;

        let (token_tx, token_rx) = mpsc::unbounded_channel();
        let (decode_tx, decode_rx) = mpsc::unbounded_channel();

        let refs = match mode {
            Mode::Read => ModeRefs {
                read: 1,
                download: 0,
            },
            Mode::Download => ModeRefs {
                read: 0,
                download: 1,
            },
        };

        let queen = Arc::new(Self {
            event_tx,
            den,
            info_store,
            info: tokio::sync::Mutex::new(info),
            table: tokio::sync::Mutex::new(state::PageTable::new(total_pages)),
            queues: tokio::sync::Mutex::new(state::RequestQueues::new(
                config.spider.preload_window,
            )),
            refs: tokio::sync::Mutex::new(refs),
            show_key: tokio::sync::Mutex::new(None),
            token_tx,
            token_notify: Notify::new(),
            decode_tx,
            decode_inflight: tokio::sync::Mutex::new(HashSet::new()),
            redecode: tokio::sync::Mutex::new(HashSet::new()),
            decoded: tokio::sync::Mutex::new(HashMap::new()),
            live_workers: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            config,
            source,
            image_decoder,
            gallery,
        });

        queen.emit(Event::PageCountDiscovered {
            gallery_id: queen.gallery.id,
            pages: total_pages,
        });

        resolver::spawn_resolution_loop(queen.clone(), token_rx);
        decoder::spawn_decoder_pool(queen.clone(), decode_rx);

        if mode == Mode::Download {
            queen.enter_download_mode().await;
        }

        Ok(queen)
    }

    /// The gallery this coordinator serves.
    pub fn gallery(&self) -> &GalleryRef {
        &self.gallery
    }

    /// Total number of pages.
    pub async fn page_count(&self) -> usize {
        self.table.lock().await.total()
    }

    /// Current state of one page.
    pub async fn page_state(&self, index: usize) -> PageState {
        self.table.lock().await.state(index)
    }

    /// Current aggregate counters.
    pub async fn counters(&self) -> PageCounters {
        self.table.lock().await.counters()
    }

    /// Record the consumer's read position for resume; persisted on
    /// teardown.
    pub async fn set_start_page(&self, page: usize) {
        self.info.lock().await.start_page = page;
    }

    /// The persisted resume position.
    pub async fn start_page(&self) -> usize {
        self.info.lock().await.start_page
    }

    /// Take a decoded image produced after a [`PageStatus::Finished`]
    /// request, if the decode has completed.
    pub async fn take_decoded(&self, index: usize) -> Option<Arc<image::DynamicImage>> {
        self.decoded.lock().await.remove(&index)
    }

    /// Request a page and return its current observable state without
    /// blocking.
    ///
    /// - `ignore_error`: a previously failed page is retried instead of
    ///   reporting its failure
    /// - `force`: any terminal state is cleared and the page re-dispatched
    ///   at the highest priority
    /// - `prime_neighbors`: refill the bounded preload queue with the next
    ///   not-yet-requested pages after `index`
    pub async fn request(
        self: &Arc<Self>,
        index: usize,
        ignore_error: bool,
        force: bool,
        prime_neighbors: bool,
    ) -> PageStatus {
        if self.cancel.is_cancelled() {
            return PageStatus::Unknown;
        }

        let mut decode = false;
        let status = {
            let mut table = self.table.lock().await;
            if index >= table.total() {
                return PageStatus::Unknown;
            }

            let status = match table.state(index) {
                PageState::Downloading => PageStatus::Downloading(table.progress_fraction(index)),
                PageState::Finished if !force => {
                    decode = true;
                    PageStatus::Finished
                }
                PageState::Failed if !force && !ignore_error => PageStatus::Failed(
                    table
                        .failure(index)
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| PageError::Interrupted.to_string()),
                ),
                state => {
                    // None, a failed page being retried, or a forced
                    // re-request of a terminal page
                    if state.is_terminal() {
                        table.reset(index);
                    }
                    let mut queues = self.queues.lock().await;
                    if force {
                        queues.push_force(index);
                    } else {
                        queues.push_on_demand(index);
                    }
                    PageStatus::Unknown
                }
            };

            if prime_neighbors {
                let window = self.config.spider.preload_window;
                let upcoming: Vec<usize> = ((index + 1)..table.total())
                    .filter(|&i| table.state(i) == PageState::None)
                    .take(window)
                    .collect();
                if !upcoming.is_empty() {
                    self.queues.lock().await.prime_preload(upcoming);
                }
            }

            status
        };

        if decode {
            self.request_decode(index).await;
        }
        self.ensure_workers().await;
        status
    }

    /// Enqueue a decode for a finished page, deduplicated against in-flight
    /// decodes.
    pub(crate) async fn request_decode(&self, index: usize) {
        let mut inflight = self.decode_inflight.lock().await;
        if inflight.insert(index) {
            let _ = self.decode_tx.send(index);
        }
    }

    /// Block until the page's token resolves, raising a resolution request
    /// to the dedicated loop when it is not yet known.
    pub(crate) async fn resolve_token(&self, index: usize) -> std::result::Result<String, PageError> {
        loop {
            let notified = self.token_notify.notified();
            tokio::pin!(notified);

            {
                let info = self.info.lock().await;
                match info.token(index) {
                    Some(TokenState::Resolved(token)) => return Ok(token.clone()),
                    Some(TokenState::Failed) => return Err(PageError::TokenUnavailable),
                    None => {}
                }
            }

            if self.token_tx.send(index).is_err() {
                // Resolution loop is gone; only happens during teardown
                return Err(PageError::Interrupted);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(PageError::Interrupted),
                _ = &mut notified => {}
            }
        }
    }

    /// Spawn workers up to the configured pool size while there is work.
    /// Idle workers exit on their own; this regrows the pool lazily.
    pub(crate) async fn ensure_workers(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mode = self.effective_mode().await;
        let has_work = self.queues.lock().await.has_work(mode);
        if !has_work {
            return;
        }

        loop {
            let live = self.live_workers.load(Ordering::SeqCst);
            if live >= self.config.spider.workers {
                break;
            }
            if self
                .live_workers
                .compare_exchange(live, live + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                worker::spawn_worker(self.clone());
            }
        }
    }

    pub(crate) async fn effective_mode(&self) -> Mode {
        self.refs.lock().await.effective()
    }

    /// Count a worker out of the pool, then regrow it if new work arrived
    /// between that worker's final queue check and this decrement.
    ///
    /// Without the re-check, a `request` racing into that window sees a
    /// fully-populated pool, spawns nothing, and leaves its queue entry
    /// stranded until an unrelated later request.
    pub(crate) async fn retire_worker(self: &Arc<Self>) {
        self.live_workers.fetch_sub(1, Ordering::SeqCst);
        self.ensure_workers().await;
    }

    pub(crate) fn emit(&self, event: Event) {
        // send() errs with no subscribers, which is fine - drop the event
        self.event_tx.send(event).ok();
    }

    /// Register one more consumer reference.
    pub(super) async fn adopt(self: &Arc<Self>, mode: Mode) -> Result<()> {
        let (before, after) = {
            let mut refs = self.refs.lock().await;
            let before = refs.effective();
            match mode {
                Mode::Read => refs.read += 1,
                Mode::Download => {
                    if refs.download >= 1 {
                        return Err(Error::DownloadBusy(self.gallery.id));
                    }
                    refs.download = 1;
                }
            }
            (before, refs.effective())
        };

        if before != after {
            match after {
                Mode::Download => self.enter_download_mode().await,
                Mode::Read => self.enter_read_mode().await,
            }
        }
        Ok(())
    }

    /// Drop one consumer reference. Returns whether this was the last one.
    pub(super) async fn release_ref(self: &Arc<Self>, mode: Mode) -> bool {
        let (before, after, empty) = {
            let mut refs = self.refs.lock().await;
            let before = refs.effective();
            match mode {
                Mode::Read => refs.read = refs.read.saturating_sub(1),
                Mode::Download => refs.download = refs.download.saturating_sub(1),
            }
            (before, refs.effective(), refs.is_empty())
        };

        if !empty && before != after {
            self.enter_read_mode().await;
        }
        empty
    }

    /// Switch into download-all: walk every page in order from a clean
    /// slate, at full worker concurrency.
    async fn enter_download_mode(self: &Arc<Self>) {
        tracing::info!(gallery_id = self.gallery.id, "entering download mode");
        self.den.set_mode(Mode::Download).await;
        {
            let mut table = self.table.lock().await;
            let mut queues = self.queues.lock().await;
            if queues.cursor().is_none() {
                queues.activate_cursor();
                table.clear_non_downloading();
            }
        }
        self.ensure_workers().await;
    }

    async fn enter_read_mode(&self) {
        tracing::info!(gallery_id = self.gallery.id, "entering read mode");
        self.den.set_mode(Mode::Read).await;
        self.queues.lock().await.deactivate_cursor();
    }

    /// Cancel every loop and persist metadata. In-flight network operations
    /// are abandoned, not drained.
    pub(super) async fn shutdown(&self) {
        tracing::info!(gallery_id = self.gallery.id, "shutting down coordinator");
        self.cancel.cancel();
        self.token_notify.notify_waiters();

        let dir = self.den.resolve_dir(false).await;
        let info = self.info.lock().await;
        self.info_store.persist(&info, dir.as_deref()).await;
    }
}
