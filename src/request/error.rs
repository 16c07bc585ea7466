//! Error types for the request layer.
//!
//! Every terminal outcome the loc.gov API can produce gets its own variant so
//! callers can tell a missing record from a rate-limit block or a garbled
//! response body. Bulk operations store the `Display` form of these in the
//! error ledger that ends up in `errors.json`.

use thiserror::Error;

/// Errors produced by [`ApiClient`](super::ApiClient) requests.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    Build {
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },

    /// Network-level error (DNS resolution, connection refused, TLS, etc.)
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error status other than the specifically-handled 404/403/429.
    #[error("HTTP {status} requesting {url}")]
    Status {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The record does not exist (HTTP 404, or a loc.gov embedded 4xx status).
    #[error("no record at {url}")]
    NotFound {
        /// The URL with no record behind it.
        url: String,
    },

    /// The server refused the request (HTTP 403).
    #[error("forbidden request (403) for {url}")]
    Forbidden {
        /// The refused URL.
        url: String,
    },

    /// The server rate-limited the session (HTTP 429).
    ///
    /// Once seen, the owning client refuses all further requests so a harvest
    /// does not keep hammering a server that has asked it to stop.
    #[error("blocked by rate limit (429) requesting {url}")]
    Blocked {
        /// The URL that triggered the block.
        url: String,
        /// Raw Retry-After header value, when the server sent one.
        retry_after: Option<String>,
    },

    /// The response body was not valid JSON.
    #[error("invalid JSON from {url}: {source}")]
    InvalidJson {
        /// The URL that returned the bad body.
        url: String,
        /// The underlying decode error.
        #[source]
        source: reqwest::Error,
    },

    /// All retry attempts were used up without a terminal classification.
    #[error("request for {url} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        /// The URL that kept failing.
        url: String,
        /// How many attempts were made.
        attempts: u32,
        /// Display form of the final failure.
        last_error: String,
    },
}

impl ApiError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn status(url: impl Into<String>, status: u16) -> Self {
        Self::Status {
            url: url.into(),
            status,
        }
    }

    /// Creates a missing-record error.
    pub fn not_found(url: impl Into<String>) -> Self {
        Self::NotFound { url: url.into() }
    }

    /// Creates a forbidden error.
    pub fn forbidden(url: impl Into<String>) -> Self {
        Self::Forbidden { url: url.into() }
    }

    /// Creates a rate-limit block error.
    pub fn blocked(url: impl Into<String>, retry_after: Option<String>) -> Self {
        Self::Blocked {
            url: url.into(),
            retry_after,
        }
    }

    /// Creates an invalid-JSON error.
    pub fn invalid_json(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::InvalidJson {
            url: url.into(),
            source,
        }
    }

    /// Creates an exhausted-retries error wrapping the final failure.
    pub fn exhausted(url: impl Into<String>, attempts: u32, last_error: impl ToString) -> Self {
        Self::Exhausted {
            url: url.into(),
            attempts,
            last_error: last_error.to_string(),
        }
    }
}

// Note on From trait implementations: we intentionally do NOT implement
// `From<reqwest::Error>` because every variant requires the request URL for
// context, which the source error does not reliably provide. The helper
// constructors are the supported path.
