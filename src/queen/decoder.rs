//! Decode pool
//!
//! A fixed number of tasks share one decode queue. Each task reads a
//! finished page's bytes back from storage and decodes them; when the bytes
//! turn out to have been evicted from the cache in the meantime, the page
//! is reset and re-requested instead of reporting a failure.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::types::Event;

use super::SpiderQueen;

pub(super) fn spawn_decoder_pool(queen: Arc<SpiderQueen>, rx: mpsc::UnboundedReceiver<usize>) {
    let rx = Arc::new(Mutex::new(rx));
    for _ in 0..queen.config.spider.decoders {
        tokio::spawn(decoder_loop(queen.clone(), rx.clone()));
    }
}

async fn decoder_loop(queen: Arc<SpiderQueen>, rx: Arc<Mutex<mpsc::UnboundedReceiver<usize>>>) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = queen.cancel.cancelled() => None,
                index = rx.recv() => index,
            }
        };
        let Some(index) = next else { break };

        decode_one(&queen, index).await;
        queen.decode_inflight.lock().await.remove(&index);
    }
}

async fn decode_one(queen: &Arc<SpiderQueen>, index: usize) {
    let gallery_id = queen.gallery().id;

    let Some(bytes) = queen.den.open_for_read(index).await else {
        // Finished page with no retrievable bytes: the cache evicted it.
        // Reset and re-download rather than surface a phantom failure.
        debug!(gallery_id, index, "stored bytes are gone, re-requesting page");
        queen.table.lock().await.reset(index);
        // Clear the in-flight marker before raising the deferred decode so
        // the post-download decode request is not dropped as a duplicate
        queen.decode_inflight.lock().await.remove(&index);
        queen.redecode.lock().await.insert(index);
        queen.request(index, false, false, false).await;
        return;
    };

    match queen.image_decoder.decode(bytes).await {
        Ok(image) => {
            queen.decoded.lock().await.insert(index, image);
            queen.emit(Event::PageDecoded { gallery_id, index });
        }
        Err(e) => {
            warn!(gallery_id, index, error = %e, "decode failed");
            queen.emit(Event::DecodeFailed {
                gallery_id,
                index,
                error: e.to_string(),
            });
        }
    }
}
