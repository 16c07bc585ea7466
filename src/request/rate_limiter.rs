//! Per-host pacing for loc.gov requests.
//!
//! loc.gov asks bulk clients to space their requests; the [`RateLimiter`]
//! enforces a minimum delay between consecutive requests to the same host.
//! Metadata lives on `www.loc.gov` while file delivery comes from
//! `tile.loc.gov`, so pacing is tracked per host rather than globally.
//!
//! The first request to a host proceeds immediately; later requests wait out
//! the remainder of the configured pause.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warn once a host has accumulated this much waiting (10 minutes).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(600);

/// Maximum honored Retry-After value (1 hour).
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Minimum-delay pacing for requests, tracked per host.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum delay between requests to the same host.
    pause: Duration,

    /// Whether pacing is disabled (`--pause 0`).
    disabled: bool,

    /// Per-host state. The Arc lets the DashMap shard lock be released
    /// before awaiting on the inner Mutex.
    hosts: DashMap<String, Arc<HostState>>,
}

/// State tracked for each host.
#[derive(Debug)]
struct HostState {
    /// Time of the last request to this host; `None` until the first request.
    last_request: Mutex<Option<Instant>>,

    /// Total delay applied to this host, in milliseconds.
    cumulative_delay_ms: AtomicU64,
}

impl HostState {
    fn new() -> Self {
        Self {
            last_request: Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(total)
    }
}

impl RateLimiter {
    /// Creates a rate limiter with the given minimum pause between requests.
    #[must_use]
    #[instrument(skip_all, fields(pause_ms = pause.as_millis()))]
    pub fn new(pause: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            pause,
            disabled: false,
            hosts: DashMap::new(),
        }
    }

    /// Creates a disabled rate limiter that applies no pauses.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            pause: Duration::ZERO,
            disabled: true,
            hosts: DashMap::new(),
        }
    }

    /// Returns whether pacing is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the configured pause between requests.
    #[must_use]
    pub fn pause(&self) -> Duration {
        self.pause
    }

    /// Waits until a request to `url`'s host is allowed, then records it.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        if self.disabled {
            return;
        }

        let host = extract_host(url);
        tracing::Span::current().record("host", &host);

        let state = self
            .hosts
            .entry(host.clone())
            .or_insert_with(|| Arc::new(HostState::new()))
            .clone();

        // Only the host Mutex is held across the await, not the map shard.
        let mut last_request_guard = state.last_request.lock().await;

        if let Some(last_request) = *last_request_guard {
            let elapsed = last_request.elapsed();
            if elapsed < self.pause {
                let delay = self.pause.saturating_sub(elapsed);
                let cumulative = state.add_cumulative_delay(delay);

                debug!(
                    host = %host,
                    delay_ms = delay.as_millis(),
                    cumulative_ms = cumulative.as_millis(),
                    "pausing before request"
                );

                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                    warn!(
                        host = %host,
                        cumulative_delay_secs = cumulative.as_secs(),
                        "harvest is spending substantial time waiting on this host"
                    );
                }

                tokio::time::sleep(delay).await;
            }
        } else {
            debug!(host = %host, "first request to host - no pause");
        }

        *last_request_guard = Some(Instant::now());
    }

    /// Records a server-mandated delay (from a Retry-After header) so the
    /// cumulative-delay accounting reflects what the server asked for.
    #[instrument(skip(self), fields(host))]
    pub fn record_server_delay(&self, url: &str, delay: Duration) {
        let host = extract_host(url);
        tracing::Span::current().record("host", &host);

        let state = self
            .hosts
            .entry(host.clone())
            .or_insert_with(|| Arc::new(HostState::new()));
        let cumulative = state.add_cumulative_delay(delay);

        debug!(
            host = %host,
            delay_ms = delay.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server-requested delay"
        );
    }
}

/// Extracts the host from a URL, lowercased.
///
/// Returns "unknown" for malformed URLs so even unparseable requests are
/// still paced against each other.
#[must_use]
pub fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports both RFC 7231 forms: integer seconds (`Retry-After: 120`) and
/// HTTP-date (`Retry-After: Wed, 21 Oct 2026 07:28:00 GMT`). Values above
/// one hour are capped; unparseable values return `None`.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();
        match datetime.duration_since(now) {
            Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
            // Date in the past
            Err(_) => Some(Duration::ZERO),
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}
