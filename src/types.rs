//! Core types for spider-dl

use serde::{Deserialize, Serialize};

/// Reference to a remote gallery, the immutable identity of one download
/// session.
///
/// Identity is `id` + `token`; `title` is carried only so the storage broker
/// can derive a human-readable permanent directory name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryRef {
    /// Remote gallery identifier
    pub id: u64,
    /// Gallery-level access token
    pub token: String,
    /// Gallery title, if known (used for the download directory name)
    #[serde(default)]
    pub title: Option<String>,
}

impl GalleryRef {
    /// Create a gallery reference without a title.
    pub fn new(id: u64, token: impl Into<String>) -> Self {
        Self {
            id,
            token: token.into(),
            title: None,
        }
    }

    /// Create a gallery reference carrying a display title.
    pub fn with_title(id: u64, token: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id,
            token: token.into(),
            title: Some(title.into()),
        }
    }
}

impl std::fmt::Display for GalleryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Per-page download state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageState {
    /// Not requested or reset for retry
    #[default]
    None,
    /// Claimed by a worker
    Downloading,
    /// Bytes stored successfully (terminal until an explicit re-request)
    Finished,
    /// Terminal failure (terminal until an explicit re-request)
    Failed,
}

impl PageState {
    /// Whether this state counts toward the `done` aggregate.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PageState::Finished | PageState::Failed)
    }
}

/// Consumer mode for a coordinator reference
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Transient viewing; pages land in the bounded ephemeral cache
    Read,
    /// Download-all; pages land in the permanent directory
    Download,
}

/// Reference counts for the two consumer modes of one coordinator.
///
/// Effective mode is `Download` iff `download > 0`. The `download <= 1`
/// invariant is enforced at `obtain`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModeRefs {
    /// Number of live read consumers
    pub read: u32,
    /// Number of live download consumers (0 or 1)
    pub download: u32,
}

impl ModeRefs {
    /// The mode the coordinator currently operates in.
    pub fn effective(&self) -> Mode {
        if self.download > 0 {
            Mode::Download
        } else {
            Mode::Read
        }
    }

    /// Whether no consumer holds a reference anymore.
    pub fn is_empty(&self) -> bool {
        self.read == 0 && self.download == 0
    }
}

/// Resolution state of one page's access token.
///
/// Absence from the token map means "unknown". `Failed` is an in-memory
/// marker only and is never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenState {
    /// Token resolved from a preview batch
    Resolved(String),
    /// Both batch-fetch attempts failed to yield this token this session
    Failed,
}

/// Immediate, non-blocking answer to a page request
#[derive(Clone, Debug, PartialEq)]
pub enum PageStatus {
    /// Nothing is known about this page yet
    Unknown,
    /// A worker holds the page; fraction of bytes received (0.0 when the
    /// total is not yet known)
    Downloading(f32),
    /// Terminal failure with its message
    Failed(String),
    /// Bytes are stored; a decode has been triggered
    Finished,
}

/// Running aggregate counters for one gallery
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCounters {
    /// Pages in `Finished` state
    pub finished: usize,
    /// Pages in `Finished` or `Failed` state
    pub done: usize,
    /// Total pages in the gallery
    pub total: usize,
}

/// Event emitted during the gallery download lifecycle
///
/// This is the Listener surface: subscribe via
/// [`SpiderRegistry::subscribe`](crate::SpiderRegistry::subscribe).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Gallery metadata resolved; the page count is now known
    PageCountDiscovered {
        /// Gallery ID
        gallery_id: u64,
        /// Total number of pages
        pages: usize,
    },

    /// The remote service rate-limited a page fetch
    RateLimited {
        /// Gallery ID
        gallery_id: u64,
        /// Page index
        index: usize,
    },

    /// Byte-progress update for a downloading page
    PageProgress {
        /// Gallery ID
        gallery_id: u64,
        /// Page index
        index: usize,
        /// Bytes received so far
        received: u64,
        /// Expected total bytes, when the remote advertised a length
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
    },

    /// Page stored successfully
    PageSuccess {
        /// Gallery ID
        gallery_id: u64,
        /// Page index
        index: usize,
        /// Running aggregate counters
        counters: PageCounters,
    },

    /// Page failed terminally
    PageFailure {
        /// Gallery ID
        gallery_id: u64,
        /// Page index
        index: usize,
        /// Failure message from the per-page taxonomy
        error: String,
        /// Whether the failure came from cancellation rather than content
        interrupted: bool,
        /// Running aggregate counters
        counters: PageCounters,
    },

    /// Every page reached a terminal state
    AllPagesDone {
        /// Gallery ID
        gallery_id: u64,
        /// Final aggregate counters
        counters: PageCounters,
    },

    /// A stored page was decoded into an in-memory image
    PageDecoded {
        /// Gallery ID
        gallery_id: u64,
        /// Page index
        index: usize,
    },

    /// Stored bytes could not be decoded
    DecodeFailed {
        /// Gallery ID
        gallery_id: u64,
        /// Page index
        index: usize,
        /// Decode error message
        error: String,
    },
}
