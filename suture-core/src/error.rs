//! Error types for Suture gateway operations.
//!
//! Cache misses, low-confidence hypotheses and rejected approvals are not
//! errors: they drive the healing attempt state machine. The variants here
//! are the conditions that abort a step or surface to a caller.

use thiserror::Error;

use crate::schema::SchemaFingerprint;

/// Result type alias for Suture operations.
pub type Result<T> = std::result::Result<T, SutureError>;

/// Core error types for the Suture gateway.
#[derive(Error, Debug)]
pub enum SutureError {
    /// Upstream could not be reached; passed through as a failure, no healing attempted
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] hyper_util::client::legacy::Error),

    /// Upstream did not answer within the configured window
    #[error("upstream timeout after {0}ms")]
    UpstreamTimeout(u64),

    /// Reasoning backend errored or produced no usable mapping
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    /// Pending approval received no decision in time (treated as rejection)
    #[error("approval timed out after {0}s")]
    ApprovalTimeout(u64),

    /// Approve/reject arrived while nothing was pending
    #[error("no healing attempt is awaiting approval")]
    ApprovalWithoutPending,

    /// Cached mapping was stored under a different key than the current drift
    #[error("fingerprint mismatch: cached under {cached}, observed {observed}")]
    FingerprintMismatch {
        cached: SchemaFingerprint,
        observed: SchemaFingerprint,
    },

    /// Upstream body is not parseable JSON
    #[error("malformed upstream body: {0}")]
    MalformedBody(String),

    /// Configuration value could not be parsed
    #[error("invalid configuration for {key}: {reason}")]
    Config { key: &'static str, reason: String },

    /// HTTP error from hyper
    #[error("http error: {0}")]
    Http(#[from] hyper::http::Error),

    /// Invalid URI
    #[error("invalid uri: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),

    /// Body streaming error
    #[error("body error: {0}")]
    Body(String),

    /// JSON encoding/decoding of gateway-owned data
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SutureError {
    /// Returns an HTTP status code appropriate for this error.
    #[inline]
    pub fn status_code(&self) -> u16 {
        match self {
            SutureError::UpstreamUnavailable(_) => 502,
            SutureError::UpstreamTimeout(_) => 504,
            SutureError::ApprovalWithoutPending => 409,
            SutureError::MalformedBody(_) => 422,
            SutureError::Config { .. } => 400,
            _ => 500,
        }
    }

    /// Returns true if the request never produced an upstream response.
    #[inline]
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            SutureError::UpstreamUnavailable(_) | SutureError::UpstreamTimeout(_)
        )
    }

    pub(crate) fn config(key: &'static str, reason: impl Into<String>) -> Self {
        SutureError::Config {
            key,
            reason: reason.into(),
        }
    }
}
