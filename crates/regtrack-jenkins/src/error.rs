//! CI client error taxonomy
//!
//! Callers branch on these kinds: timeouts and connection failures are
//! transient and retried upstream, HTTP statuses are per-build failures,
//! decode errors are source defects.

use thiserror::Error;

/// Result type alias for CI client operations
pub type JenkinsResult<T> = std::result::Result<T, JenkinsError>;

/// Errors surfaced by the Jenkins client
#[derive(Debug, Error)]
pub enum JenkinsError {
    /// Connection-level failure (DNS, refused, reset)
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    /// Server answered with a non-success status
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// Body could not be decoded into the expected shape
    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },

    /// The per-request deadline elapsed
    #[error("request to {url} timed out")]
    Timeout { url: String },
}

impl JenkinsError {
    /// Whether a retry can plausibly succeed
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Request { .. } | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500,
            Self::Decode { .. } => false,
        }
    }

    pub(crate) fn from_reqwest(url: &str, source: &reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else if source.is_decode() {
            Self::Decode {
                url: url.to_string(),
                message: source.to_string(),
            }
        } else {
            Self::Request {
                url: url.to_string(),
                message: source.to_string(),
            }
        }
    }
}
