//! Coordinator unit tests, grouped by concern.


use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::decode::DynamicImageDecoder;
use crate::queen::test_helpers::{MockSource, test_config};
use crate::queen::{SpiderQueen, SpiderRegistry};
use crate::types::{Event, GalleryRef, PageState};

pub(super) async fn registry_with(source: Arc<MockSource>, root: &Path) -> SpiderRegistry {
    SpiderRegistry::new(test_config(root), source, Arc::new(DynamicImageDecoder))
        .await
        .expect("registry construction should succeed")
}

pub(super) fn gallery() -> GalleryRef {
    GalleryRef::with_title(1, "gtok", "Unit Gallery")
}

/// Poll until the page reaches a terminal state.
pub(super) async fn wait_for_terminal(queen: &Arc<SpiderQueen>, index: usize) -> PageState {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let state = queen.page_state(index).await;
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("page never reached a terminal state")
}

/// Drain events until one matches, or time out.
pub(super) async fn wait_for_event(
    rx: &mut broadcast::Receiver<Event>,
    mut matches: impl FnMut(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}
