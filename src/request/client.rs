//! Retry/backoff HTTP client for the loc.gov JSON API.
//!
//! [`ApiClient`] wraps a single `reqwest::Client` (one session, reused for
//! every call), a [`RetryPolicy`], and a per-host [`RateLimiter`]. All request
//! behavior documented for bulk loc.gov clients lives here:
//!
//! - transient failures (network, timeout, HTTP 5xx, embedded 5xx statuses)
//!   are retried with a linearly growing sleep;
//! - 404 and 403 are terminal;
//! - 429 is terminal for the whole session: the client sets a blocked flag and
//!   refuses every subsequent request without touching the network;
//! - loc.gov records that embed a 4xx `status` are retried twice, then
//!   reported as missing;
//! - partial records (`options.is_partial`, a backend timeout marker) get an
//!   extra long pause before the retry so the cache can catch up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::user_agent;

use super::rate_limiter::{RateLimiter, parse_retry_after};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use super::{ApiError, DEFAULT_MAX_ATTEMPTS};

/// Connect timeout for all requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read timeout for JSON requests.
const JSON_TIMEOUT: Duration = Duration::from_secs(60);

/// Read timeout for file downloads (media files can be large).
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Extra pause after a partial record, to let the search cache catch up.
const PARTIAL_RECORD_PAUSE: Duration = Duration::from_secs(60);

/// How many times a loc.gov embedded 4xx status is retried before giving up.
/// The API intermittently reports fresh records as missing.
const EMBEDDED_NOT_FOUND_RETRIES: u32 = 2;

/// Configuration for [`ApiClient`] construction.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Caller identifier (email address or app URL) prefixed to the
    /// User-Agent so Library of Congress staff can attribute traffic.
    pub user_agent: Option<String>,
    /// Base pause between requests to the same host; also the base unit of
    /// retry backoff. Zero disables pacing.
    pub pause: Duration,
    /// Maximum attempts per request, including the first.
    pub max_attempts: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_agent: None,
            pause: Duration::from_secs(5),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// HTTP client for loc.gov requests with retry, pacing, and session state.
///
/// Create once and reuse for the whole harvest; connection pooling and the
/// rate-limit block flag both depend on the client being shared.
#[derive(Debug)]
pub struct ApiClient {
    client: Client,
    policy: RetryPolicy,
    limiter: Arc<RateLimiter>,
    /// Set after a 429; all later requests short-circuit.
    blocked: AtomicBool,
}

impl ApiClient {
    /// Creates a client with default options.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Build`] if HTTP client construction fails.
    pub fn new() -> Result<Self, ApiError> {
        Self::with_options(&ClientOptions::default())
    }

    /// Creates a client from explicit options.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Build`] if HTTP client construction fails.
    #[instrument(skip_all, fields(pause_ms = options.pause.as_millis(), max_attempts = options.max_attempts))]
    pub fn with_options(options: &ClientOptions) -> Result<Self, ApiError> {
        let user_agent = match options.user_agent.as_deref() {
            Some(identity) => user_agent::user_agent_with_identity(identity),
            None => user_agent::default_user_agent(),
        };

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(JSON_TIMEOUT)
            .gzip(true)
            .user_agent(user_agent)
            .build()
            .map_err(|source| ApiError::Build { source })?;

        let limiter = if options.pause.is_zero() {
            Arc::new(RateLimiter::disabled())
        } else {
            Arc::new(RateLimiter::new(options.pause))
        };

        Ok(Self {
            client,
            policy: RetryPolicy::with_attempts_and_pause(options.max_attempts, options.pause),
            limiter,
            blocked: AtomicBool::new(false),
        })
    }

    /// Returns the retry policy in use.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns whether the session has been blocked by a 429.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Fetches a loc.gov JSON record, applying the full retry policy plus the
    /// loc.gov-specific body checks (embedded status, partial records).
    ///
    /// `params` are appended to the query string; callers typically pass
    /// `fo=json` and an `at=` key filter.
    ///
    /// # Errors
    ///
    /// See the module docs for the terminal classifications.
    #[instrument(skip(self, params), fields(url = %url))]
    pub async fn get_locgov_json(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, ApiError> {
        let mut attempt: u32 = 0;
        let mut embedded_not_found: u32 = 0;

        loop {
            self.ensure_not_blocked(url)?;
            attempt += 1;
            self.limiter.acquire(url).await;
            debug!(attempt, "requesting loc.gov JSON");

            let failure = match self.send(url, params, None).await {
                Ok(response) => match response.json::<Value>().await {
                    // Not retried: a cut-off or non-JSON body will not heal on
                    // its own (usually an oversized `c` parameter).
                    Err(source) => return Err(ApiError::invalid_json(url, source)),
                    Ok(body) => match classify_locgov_body(&body) {
                        LocGovBody::Ready => {
                            debug!("successful request (loc.gov JSON)");
                            return Ok(body);
                        }
                        LocGovBody::NotFound(status) => {
                            embedded_not_found += 1;
                            if embedded_not_found > EMBEDDED_NOT_FOUND_RETRIES
                                || attempt >= self.policy.max_attempts()
                            {
                                warn!(status, "record reports an embedded 4xx status; giving up");
                                return Err(ApiError::not_found(url));
                            }
                            warn!(status, "record reports an embedded 4xx status; retrying");
                            tokio::time::sleep(self.policy.calculate_delay(attempt)).await;
                            continue;
                        }
                        LocGovBody::Partial => {
                            if attempt >= self.policy.max_attempts() {
                                return Err(ApiError::exhausted(
                                    url,
                                    attempt,
                                    "partial record (backend timeout)",
                                ));
                            }
                            info!(
                                pause_secs = PARTIAL_RECORD_PAUSE.as_secs(),
                                "partial record received; pausing to let the cache catch up"
                            );
                            tokio::time::sleep(PARTIAL_RECORD_PAUSE).await;
                            continue;
                        }
                        // Embedded 5xx behaves like a transport 5xx.
                        LocGovBody::ServerError(status) => ApiError::status(url, status),
                    },
                },
                Err(error) => error,
            };

            self.backoff_or_bail(url, failure, attempt).await?;
        }
    }

    /// Fetches a raw response (for file downloads), applying the same retry
    /// policy without any body interpretation.
    ///
    /// # Errors
    ///
    /// See the module docs for the terminal classifications.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn get_response(&self, url: &str) -> Result<Response, ApiError> {
        let mut attempt: u32 = 0;

        loop {
            self.ensure_not_blocked(url)?;
            attempt += 1;
            self.limiter.acquire(url).await;
            debug!(attempt, "requesting file");

            match self.send(url, &[], Some(DOWNLOAD_TIMEOUT)).await {
                Ok(response) => return Ok(response),
                Err(failure) => self.backoff_or_bail(url, failure, attempt).await?,
            }
        }
    }

    /// Sends a single GET and maps the outcome onto [`ApiError`].
    async fn send(
        &self,
        url: &str,
        params: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<Response, ApiError> {
        let mut request = self.client.get(url);
        if !params.is_empty() {
            request = request.query(params);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::timeout(url)
            } else {
                ApiError::network(url, e)
            }
        })?;

        let status = response.status();
        match status.as_u16() {
            code if status.is_success() => {
                debug!(code, "successful response");
                Ok(response)
            }
            429 => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                if let Some(value) = retry_after.as_deref()
                    && let Some(delay) = parse_retry_after(value)
                {
                    self.limiter.record_server_delay(url, delay);
                    warn!(
                        retry_after_secs = delay.as_secs(),
                        "server asked for a pause before further requests"
                    );
                }
                Err(ApiError::blocked(url, retry_after))
            }
            404 => Err(ApiError::not_found(url)),
            403 => Err(ApiError::forbidden(url)),
            code => Err(ApiError::status(url, code)),
        }
    }

    /// Sleeps per the retry policy, or converts the failure into its terminal
    /// form. A 429 flips the session-wide blocked flag first.
    async fn backoff_or_bail(
        &self,
        url: &str,
        failure: ApiError,
        attempt: u32,
    ) -> Result<(), ApiError> {
        if matches!(failure, ApiError::Blocked { .. }) {
            self.blocked.store(true, Ordering::SeqCst);
            error!(url, "too many requests (429); halting all requests for this session");
            return Err(failure);
        }

        let failure_type = classify_error(&failure);
        match self.policy.should_retry(failure_type, attempt) {
            RetryDecision::Retry {
                delay,
                attempt: next_attempt,
            } => {
                info!(
                    attempt = next_attempt,
                    max_attempts = self.policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    error = %failure,
                    "retrying request"
                );
                tokio::time::sleep(delay).await;
                Ok(())
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(%reason, "not retrying");
                if failure_type == FailureType::Transient {
                    Err(ApiError::exhausted(url, attempt, &failure))
                } else {
                    Err(failure)
                }
            }
        }
    }

    fn ensure_not_blocked(&self, url: &str) -> Result<(), ApiError> {
        if self.is_blocked() {
            error!(url, "session blocked by an earlier 429; skipping request");
            return Err(ApiError::blocked(url, None));
        }
        Ok(())
    }
}

/// Outcome of inspecting a loc.gov JSON body.
#[derive(Debug, PartialEq, Eq)]
enum LocGovBody {
    /// A usable record.
    Ready,
    /// The record embeds a 4xx `status`.
    NotFound(u16),
    /// The record embeds a 5xx `status`.
    ServerError(u16),
    /// `options.is_partial` is set; the backend timed out mid-query.
    Partial,
}

/// loc.gov reports some errors inside a 200 body via a `status` field, and
/// flags backend timeouts via `options.is_partial`. The status arrives as a
/// number or a string depending on the endpoint.
fn classify_locgov_body(body: &Value) -> LocGovBody {
    let status = body.get("status").and_then(|value| match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    });

    #[allow(clippy::cast_possible_truncation)]
    if let Some(status) = status {
        if (400..500).contains(&status) {
            return LocGovBody::NotFound(status as u16);
        }
        if (500..600).contains(&status) {
            return LocGovBody::ServerError(status as u16);
        }
    }

    // `at=` responses carry the dotted key literally; full records nest it.
    let is_partial = body
        .get("options.is_partial")
        .or_else(|| body.pointer("/options/is_partial"))
        .and_then(Value::as_bool);
    if is_partial == Some(true) {
        return LocGovBody::Partial;
    }

    LocGovBody::Ready
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_client(max_attempts: u32) -> ApiClient {
        ApiClient::with_options(&ClientOptions {
            user_agent: None,
            pause: Duration::ZERO,
            max_attempts,
        })
        .unwrap()
    }

    #[test]
    fn test_classify_body_ready() {
        assert_eq!(
            classify_locgov_body(&json!({"results": [], "pagination": {}})),
            LocGovBody::Ready
        );
    }

    #[test]
    fn test_classify_body_embedded_status_as_number_and_string() {
        assert_eq!(
            classify_locgov_body(&json!({"status": 404})),
            LocGovBody::NotFound(404)
        );
        assert_eq!(
            classify_locgov_body(&json!({"status": "503"})),
            LocGovBody::ServerError(503)
        );
    }

    #[test]
    fn test_classify_body_partial_dotted_and_nested() {
        assert_eq!(
            classify_locgov_body(&json!({"options.is_partial": true})),
            LocGovBody::Partial
        );
        assert_eq!(
            classify_locgov_body(&json!({"options": {"is_partial": true}})),
            LocGovBody::Partial
        );
        assert_eq!(
            classify_locgov_body(&json!({"options.is_partial": false})),
            LocGovBody::Ready
        );
    }

    #[tokio::test]
    async fn test_get_locgov_json_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/item/2021667925/"))
            .and(query_param("fo", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"item": {"id": "x"}})))
            .mount(&server)
            .await;

        let client = fast_client(3);
        let url = format!("{}/item/2021667925/", server.uri());
        let body = client
            .get_locgov_json(&url, &[("fo", "json")])
            .await
            .unwrap();
        assert_eq!(body["item"]["id"], "x");
    }

    #[tokio::test]
    async fn test_get_locgov_json_retries_5xx_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/item/1/"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/item/1/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client(5);
        let url = format!("{}/item/1/", server.uri());
        let body = client.get_locgov_json(&url, &[]).await.unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_get_locgov_json_404_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/item/missing/"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client(5);
        let url = format!("{}/item/missing/", server.uri());
        let result = client.get_locgov_json(&url, &[]).await;
        assert!(matches!(result, Err(ApiError::NotFound { .. })), "{result:?}");
    }

    #[tokio::test]
    async fn test_get_locgov_json_403_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/item/1/"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client(5);
        let url = format!("{}/item/1/", server.uri());
        let result = client.get_locgov_json(&url, &[]).await;
        assert!(matches!(result, Err(ApiError::Forbidden { .. })), "{result:?}");
    }

    #[tokio::test]
    async fn test_429_blocks_the_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/item/1/"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client(5);
        let url = format!("{}/item/1/", server.uri());
        let result = client.get_locgov_json(&url, &[]).await;
        match result {
            Err(ApiError::Blocked { retry_after, .. }) => {
                assert_eq!(retry_after.as_deref(), Some("120"));
            }
            other => panic!("expected Blocked, got {other:?}"),
        }
        assert!(client.is_blocked());

        // Second request must short-circuit without reaching the server
        // (the mock's expect(1) enforces this on drop).
        let url2 = format!("{}/item/2/", server.uri());
        let result = client.get_locgov_json(&url2, &[]).await;
        assert!(matches!(result, Err(ApiError::Blocked { .. })));
    }

    #[tokio::test]
    async fn test_invalid_json_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/item/1/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client(5);
        let url = format!("{}/item/1/", server.uri());
        let result = client.get_locgov_json(&url, &[]).await;
        assert!(matches!(result, Err(ApiError::InvalidJson { .. })), "{result:?}");
    }

    #[tokio::test]
    async fn test_exhausted_after_max_attempts_of_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/item/1/"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let client = fast_client(3);
        let url = format!("{}/item/1/", server.uri());
        let result = client.get_locgov_json(&url, &[]).await;
        match result {
            Err(ApiError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_embedded_not_found_retried_twice_then_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/item/1/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 404})))
            .expect(3)
            .mount(&server)
            .await;

        let client = fast_client(10);
        let url = format!("{}/item/1/", server.uri());
        let result = client.get_locgov_json(&url, &[]).await;
        assert!(matches!(result, Err(ApiError::NotFound { .. })), "{result:?}");
    }

    #[tokio::test]
    async fn test_embedded_server_error_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/item/1/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "500"})))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/item/1/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"item": {}})))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client(5);
        let url = format!("{}/item/1/", server.uri());
        let body = client.get_locgov_json(&url, &[]).await.unwrap();
        assert!(body.get("item").is_some());
    }

    #[tokio::test]
    async fn test_user_agent_header_sent() {
        use wiremock::{Match, Request};

        struct UaMatcher;
        impl Match for UaMatcher {
            fn matches(&self, request: &Request) -> bool {
                request
                    .headers
                    .get("User-Agent")
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|ua| {
                        ua.starts_with("me@example.org") && ua.contains("locgov-harvest")
                    })
            }
        }

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/item/1/"))
            .and(UaMatcher)
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::with_options(&ClientOptions {
            user_agent: Some("me@example.org".to_string()),
            pause: Duration::ZERO,
            max_attempts: 1,
        })
        .unwrap();
        let url = format!("{}/item/1/", server.uri());
        client.get_locgov_json(&url, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_response_streams_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage-services/public/file.jp2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"JP2 bytes".to_vec()))
            .mount(&server)
            .await;

        let client = fast_client(3);
        let url = format!("{}/storage-services/public/file.jp2", server.uri());
        let response = client.get_response(&url).await.unwrap();
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"JP2 bytes");
    }
}
