//! Token-resolution loop
//!
//! A single task per coordinator serializes all remote metadata fetches.
//! Workers raise a page index on the channel and park on the coordinator's
//! notify; after every merge attempt the loop wakes all waiters so they can
//! re-check the token map.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::TokenState;

use super::SpiderQueen;

pub(super) fn spawn_resolution_loop(
    queen: Arc<SpiderQueen>,
    mut rx: mpsc::UnboundedReceiver<usize>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let index = tokio::select! {
                _ = queen.cancel.cancelled() => break,
                request = rx.recv() => match request {
                    Some(index) => index,
                    None => break,
                },
            };
            resolve_one(&queen, index).await;
            queen.token_notify.notify_waiters();
        }
        debug!(gallery_id = queen.gallery().id, "resolution loop exited");
    })
}

/// Fetch the preview batch covering `index` until its token appears, up to
/// the failure budget. Exhausting the budget marks the token failed in
/// memory only, so the next session gets a fresh start.
async fn resolve_one(queen: &Arc<SpiderQueen>, index: usize) {
    {
        let info = queen.info.lock().await;
        if info.token(index).is_some() {
            return;
        }
    }

    let budget = queen.config.spider.token_failure_budget;
    let mut failures = 0u32;
    while failures < budget {
        if queen.cancel.is_cancelled() {
            return;
        }

        let dir = queen.den.resolve_dir(false).await;
        let mut info = queen.info.lock().await;
        let preview_index = info.preview_index_of(index);
        match queen
            .info_store
            .resolve_token_batch(queen.gallery(), &mut info, preview_index, dir.as_deref())
            .await
        {
            Ok(merged) => {
                if info.token(index).is_some() {
                    debug!(
                        gallery_id = queen.gallery().id,
                        index, merged, "token resolved"
                    );
                    return;
                }
                // A successful fetch that still lacks the token counts
                // against the budget too
                failures += 1;
                warn!(
                    gallery_id = queen.gallery().id,
                    index, preview_index, "preview batch did not carry the requested token"
                );
            }
            Err(e) => {
                failures += 1;
                warn!(
                    gallery_id = queen.gallery().id,
                    index,
                    preview_index,
                    error = %e,
                    "token batch fetch failed"
                );
            }
        }
    }

    queen
        .info
        .lock()
        .await
        .tokens
        .insert(index, TokenState::Failed);
}
