//! The request layer: retry/backoff HTTP client, failure classification, and
//! per-host pacing for loc.gov traffic.

mod client;
mod error;
pub mod rate_limiter;
mod retry;

pub use client::{ApiClient, ClientOptions};
pub use error::ApiError;
pub use rate_limiter::{RateLimiter, extract_host, parse_retry_after};
pub use retry::{DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_error};
