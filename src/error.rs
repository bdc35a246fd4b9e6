//! Error types for spider-dl
//!
//! Two layers of errors are used throughout the crate:
//! - [`Error`] - top-level failures surfaced to API callers (configuration,
//!   metadata resolution, registry misuse)
//! - [`PageError`] - the per-page failure taxonomy recorded in the page-state
//!   table and surfaced through failure events

use thiserror::Error;

use crate::source::SourceError;

/// Result type alias for spider-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for spider-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "download_dir")
        key: Option<String>,
    },

    /// Gallery metadata could not be resolved or is invalid
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Per-page download or decode error
    #[error("page error: {0}")]
    Page(#[from] PageError),

    /// Remote source error
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A second concurrent download-all session was requested for the same
    /// gallery. Only one download session per gallery is allowed; read
    /// sessions are unrestricted.
    #[error("gallery {0} already has an active download session")]
    DownloadBusy(u64),
}

/// Per-page failure taxonomy
///
/// Every terminal page failure is one of these. `Interrupted` is produced by
/// cancellation only and must not be treated as a genuine content error by
/// callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    /// The remote service answered with a rate-limit response. Terminal for
    /// the page with no further fallback.
    #[error("rate limited by remote service")]
    RateLimited,

    /// The page's access token could not be resolved after exhausting the
    /// batch-fetch budget
    #[error("could not get access token")]
    TokenUnavailable,

    /// A storage sink or source could not be opened or written
    #[error("storage failure: {0}")]
    Storage(String),

    /// Transport-level failure (timeout, reset, DNS)
    #[error("network failure: {0}")]
    Network(String),

    /// The received body was incomplete or did not look like image data
    #[error("invalid content: {0}")]
    Content(String),

    /// Stored bytes could not be decoded into an image
    #[error("decode failure: {0}")]
    Decode(String),

    /// The attempt was aborted by pool shutdown
    #[error("interrupted")]
    Interrupted,
}

impl PageError {
    /// Whether this failure came from cancellation rather than a genuine
    /// content or network problem.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, PageError::Interrupted)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_is_distinguished_from_other_failures() {
        assert!(PageError::Interrupted.is_interrupted());
        assert!(!PageError::RateLimited.is_interrupted());
        assert!(!PageError::Storage("disk full".into()).is_interrupted());
    }

    #[test]
    fn page_error_messages_are_distinct() {
        let msgs = [
            PageError::RateLimited.to_string(),
            PageError::TokenUnavailable.to_string(),
            PageError::Storage("x".into()).to_string(),
            PageError::Network("x".into()).to_string(),
            PageError::Content("x".into()).to_string(),
            PageError::Interrupted.to_string(),
        ];
        for (i, a) in msgs.iter().enumerate() {
            for b in msgs.iter().skip(i + 1) {
                assert_ne!(a, b, "failure taxonomy messages must not collide");
            }
        }
    }

    #[test]
    fn token_failure_uses_dedicated_message() {
        assert_eq!(
            PageError::TokenUnavailable.to_string(),
            "could not get access token"
        );
    }
}
