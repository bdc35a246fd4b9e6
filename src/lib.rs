//! # spider-dl
//!
//! Backend library for concurrent gallery-image downloading.
//!
//! ## Design Philosophy
//!
//! spider-dl is designed to be:
//! - **One coordinator per gallery** - Obtained from a registry, shared by
//!   reference counting, torn down when the last consumer leaves
//! - **Non-blocking** - A page request answers immediately with the page's
//!   observable state; the bytes arrive in the background
//! - **Event-driven** - Consumers subscribe to events, no polling required
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use spider_dl::{Config, DynamicImageDecoder, GalleryRef, Mode, SpiderRegistry};
//! # use spider_dl::GallerySource;
//! # fn my_source() -> Arc<dyn GallerySource> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = SpiderRegistry::new(
//!         Config::default(),
//!         my_source(),
//!         Arc::new(DynamicImageDecoder),
//!     )
//!     .await?;
//!
//!     // Subscribe to events
//!     let mut events = registry.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let gallery = GalleryRef::with_title(618395, "0439fa3666", "Example Gallery");
//!     let queen = registry.obtain(gallery, Mode::Read).await?;
//!     queen.request(0, false, false, true).await;
//!
//!     registry.release(&queen, Mode::Read).await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Backoff delays between fetch attempts
mod backoff;
/// Shared bounded page cache
pub mod cache;
/// Configuration types
pub mod config;
/// Image decoding seam
pub mod decode;
/// Per-gallery storage broker
pub mod den;
/// Error types
pub mod error;
/// Persistent gallery metadata
pub mod info;
/// Per-gallery coordinator, worker pool, and registry
pub mod queen;
/// Remote service boundary
pub mod source;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use cache::PageCache;
pub use config::{BackoffConfig, Config, SpiderConfig, StorageConfig};
pub use decode::{DynamicImageDecoder, ImageDecoder};
pub use den::Den;
pub use error::{Error, PageError, Result};
pub use info::SpiderInfo;
pub use queen::{SpiderQueen, SpiderRegistry};
pub use source::{
    ByteResponse, GalleryMetadata, GallerySource, HttpFetcher, PageApi, PageHtml, SourceError,
};
pub use types::{
    Event, GalleryRef, Mode, PageCounters, PageState, PageStatus, TokenState,
};
