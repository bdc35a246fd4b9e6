//! Download worker pool
//!
//! Workers pull dispatches from the coordinator's queues, run the fallback
//! chain for one page each, and exit when the queues run dry. The pool is
//! regrown lazily by [`SpiderQueen::ensure_workers`].
//!
//! Fallback chain per attempt: derive the image URL (HTML fetch, or the
//! lightweight API fetch when a show key is cached), then stream the bytes
//! into storage. A rate-limit response ends the page immediately; a show-key
//! mismatch re-derives from HTML without consuming an attempt; everything
//! else retries with backoff until the attempt budget runs out.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::backoff::Backoff;
use crate::error::PageError;
use crate::source::SourceError;
use crate::types::{Event, PageState};
use crate::utils::{extension_from_content_type, looks_like_text, sniff_extension};

use super::SpiderQueen;
use super::state::Dispatch;

pub(super) fn spawn_worker(queen: Arc<SpiderQueen>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if queen.cancel.is_cancelled() {
                break;
            }
            let mode = queen.effective_mode().await;
            let dispatch = {
                let table = queen.table.lock().await;
                let mut queues = queen.queues.lock().await;
                queues.pop(&table, mode)
            };
            let Some(dispatch) = dispatch else { break };
            run_page(&queen, dispatch).await;
        }
        // retire_worker re-checks the queues after counting this worker
        // out, so work enqueued between the final pop and the decrement is
        // not stranded
        queen.retire_worker().await;
        trace!("worker exited");
    })
}

/// Process one dispatched page end to end, flipping its state and emitting
/// the outcome events.
async fn run_page(queen: &Arc<SpiderQueen>, dispatch: Dispatch) {
    let index = dispatch.index;
    let gallery_id = queen.gallery().id;

    {
        let mut table = queen.table.lock().await;
        // Stale queue entries are dropped here; only an untouched page may
        // be claimed
        if table.state(index) != PageState::None {
            return;
        }
        table.set_downloading(index);
    }

    match attempt_page(queen, index, dispatch.forced).await {
        Ok(()) => {
            let counters = queen.table.lock().await.set_finished(index);
            debug!(gallery_id, index, "page finished");
            queen.emit(Event::PageSuccess {
                gallery_id,
                index,
                counters,
            });
            if counters.done == counters.total {
                queen.emit(Event::AllPagesDone {
                    gallery_id,
                    counters,
                });
            }
            // A decode that found its bytes evicted is waiting on this
            // re-download
            if queen.redecode.lock().await.remove(&index) {
                queen.request_decode(index).await;
            }
        }
        Err(error) => {
            if !error.is_interrupted() {
                // Drop any bytes a previous state left behind for this page
                queen.den.remove(index).await;
            }
            if error == PageError::RateLimited {
                queen.emit(Event::RateLimited { gallery_id, index });
            }
            let counters = queen.table.lock().await.set_failed(index, error.clone());
            warn!(gallery_id, index, error = %error, "page failed");
            queen.emit(Event::PageFailure {
                gallery_id,
                index,
                error: error.to_string(),
                interrupted: error.is_interrupted(),
                counters,
            });
            if counters.done == counters.total {
                queen.emit(Event::AllPagesDone {
                    gallery_id,
                    counters,
                });
            }
        }
    }
}

/// One URL-derivation step of the fallback chain.
enum Derived {
    Url(String),
    Retry,
}

async fn attempt_page(
    queen: &Arc<SpiderQueen>,
    index: usize,
    forced: bool,
) -> Result<(), PageError> {
    // Already-stored pages short-circuit unless the dispatch was forced.
    // In download mode this check also promotes cached bytes.
    if !forced && queen.den.contains(index).await {
        return Ok(());
    }

    let token = queen.resolve_token(index).await?;
    let previous_token = match index {
        0 => None,
        _ => Some(queen.resolve_token(index - 1).await?),
    };

    let budget = queen.config.spider.attempt_budget;
    let mut backoff = Backoff::new(&queen.config.backoff);
    let mut skip_key: Option<String> = None;
    let mut force_html = false;
    let mut attempts = 0u32;
    let mut last_error = PageError::Network("no fetch attempted".into());

    while attempts < budget {
        if queen.cancel.is_cancelled() {
            return Err(PageError::Interrupted);
        }

        let cached_show_key = match force_html {
            true => None,
            false => queen.show_key.lock().await.clone(),
        };

        let derived = match cached_show_key {
            None => {
                match queen
                    .source
                    .fetch_page_html(queen.gallery(), index, &token, skip_key.as_deref())
                    .await
                {
                    Ok(html) => {
                        *queen.show_key.lock().await = Some(html.show_key);
                        if html.skip_key.is_some() {
                            skip_key = html.skip_key;
                        }
                        force_html = false;
                        Derived::Url(html.image_url)
                    }
                    Err(SourceError::RateLimited) => return Err(PageError::RateLimited),
                    Err(e) => {
                        last_error = PageError::Network(e.to_string());
                        attempts += 1;
                        sleep_backoff(queen, &mut backoff).await?;
                        Derived::Retry
                    }
                }
            }
            Some(show_key) => {
                match queen
                    .source
                    .fetch_page_api(
                        queen.gallery(),
                        index,
                        &token,
                        &show_key,
                        previous_token.as_deref(),
                    )
                    .await
                {
                    Ok(api) => {
                        if api.skip_key.is_some() {
                            skip_key = api.skip_key;
                        }
                        Derived::Url(api.image_url)
                    }
                    Err(SourceError::KeyMismatch) => {
                        // Stale session key: forget it and re-derive from
                        // HTML, without consuming an attempt
                        let mut guard = queen.show_key.lock().await;
                        if guard.as_deref() == Some(show_key.as_str()) {
                            *guard = None;
                        }
                        force_html = true;
                        Derived::Retry
                    }
                    Err(SourceError::RateLimited) => return Err(PageError::RateLimited),
                    Err(e) => {
                        last_error = PageError::Network(e.to_string());
                        attempts += 1;
                        force_html = true;
                        sleep_backoff(queen, &mut backoff).await?;
                        Derived::Retry
                    }
                }
            }
        };

        let Derived::Url(image_url) = derived else {
            continue;
        };

        match download_image(queen, index, &image_url).await {
            Ok(()) => return Ok(()),
            Err(DownloadFault::Recoverable(error)) => {
                debug!(
                    gallery_id = queen.gallery().id,
                    index,
                    error = %error,
                    "content fetch failed, re-deriving the image URL"
                );
                last_error = error;
                force_html = true;
                attempts += 1;
                sleep_backoff(queen, &mut backoff).await?;
            }
            Err(DownloadFault::Fatal(error)) => return Err(error),
        }
    }

    Err(last_error)
}

async fn sleep_backoff(
    queen: &Arc<SpiderQueen>,
    backoff: &mut Backoff<'_>,
) -> Result<(), PageError> {
    let delay = backoff.next_delay();
    tokio::select! {
        _ = queen.cancel.cancelled() => Err(PageError::Interrupted),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// How a content fetch failed: recoverable faults send the attempt loop
/// back to URL derivation, fatal ones end the page.
enum DownloadFault {
    Recoverable(PageError),
    Fatal(PageError),
}

/// Stream the image body into storage, validating that it is plausible
/// image content and reporting progress along the way.
async fn download_image(
    queen: &Arc<SpiderQueen>,
    index: usize,
    url: &str,
) -> Result<(), DownloadFault> {
    let gallery_id = queen.gallery().id;

    let response = tokio::select! {
        _ = queen.cancel.cancelled() => return Err(DownloadFault::Fatal(PageError::Interrupted)),
        response = queen.source.fetch_bytes(url, None) => response.map_err(|e| match e {
            SourceError::RateLimited => DownloadFault::Fatal(PageError::RateLimited),
            e => DownloadFault::Recoverable(PageError::Network(e.to_string())),
        })?,
    };

    if response.status >= 400 {
        return Err(DownloadFault::Recoverable(PageError::Content(format!(
            "HTTP status {}",
            response.status
        ))));
    }

    let total = response.content_length;
    let mut stream = response.stream;

    let first = tokio::select! {
        _ = queen.cancel.cancelled() => return Err(DownloadFault::Fatal(PageError::Interrupted)),
        chunk = stream.next() => match chunk {
            None => return Err(DownloadFault::Recoverable(PageError::Content("empty body".into()))),
            Some(Err(e)) => return Err(DownloadFault::Recoverable(PageError::Network(e.to_string()))),
            Some(Ok(chunk)) => chunk,
        },
    };

    // A textual body here is a block or error page, not image data
    let content_type = response.content_type.as_deref();
    let sniffed = sniff_extension(&first);
    let textual_header = content_type.is_some_and(|ct| ct.starts_with("text/"));
    if textual_header || (sniffed.is_none() && looks_like_text(&first)) {
        return Err(DownloadFault::Recoverable(PageError::Content(
            "response body looks like text, not an image".into(),
        )));
    }

    let extension = sniffed
        .or_else(|| content_type.and_then(extension_from_content_type))
        .unwrap_or("jpg");

    let mut sink = queen
        .den
        .open_for_write(index, extension)
        .await
        .map_err(|e| DownloadFault::Fatal(PageError::Storage(e.to_string())))?;

    let mut received = 0u64;
    if let Err(e) = sink.write_chunk(&first).await {
        sink.discard().await;
        return Err(DownloadFault::Fatal(PageError::Storage(e.to_string())));
    }
    received += first.len() as u64;
    report_progress(queen, index, received, total).await;

    loop {
        let chunk = tokio::select! {
            _ = queen.cancel.cancelled() => {
                sink.discard().await;
                return Err(DownloadFault::Fatal(PageError::Interrupted));
            }
            chunk = stream.next() => chunk,
        };
        match chunk {
            None => break,
            Some(Err(e)) => {
                sink.discard().await;
                return Err(DownloadFault::Recoverable(PageError::Network(
                    e.to_string(),
                )));
            }
            Some(Ok(chunk)) => {
                if let Err(e) = sink.write_chunk(&chunk).await {
                    sink.discard().await;
                    return Err(DownloadFault::Fatal(PageError::Storage(e.to_string())));
                }
                received += chunk.len() as u64;
                report_progress(queen, index, received, total).await;
            }
        }
    }

    if let Some(expected) = total {
        if received < expected {
            sink.discard().await;
            return Err(DownloadFault::Recoverable(PageError::Content(format!(
                "short body: {received} of {expected} bytes"
            ))));
        }
    }

    sink.commit()
        .await
        .map_err(|e| DownloadFault::Fatal(PageError::Storage(e.to_string())))?;

    trace!(gallery_id, index, received, "page body stored");
    Ok(())
}

async fn report_progress(
    queen: &Arc<SpiderQueen>,
    index: usize,
    received: u64,
    total: Option<u64>,
) {
    queen
        .table
        .lock()
        .await
        .update_progress(index, received, total);
    queen.emit(Event::PageProgress {
        gallery_id: queen.gallery().id,
        index,
        received,
        total,
    });
}
