//! Paginated loc.gov search.
//!
//! A loc.gov search URL returns one page of results at a time;
//! [`express_search`] walks the `sp=` pages until the pagination section says
//! it is done, an error ends the run, or a requested result cap is reached.

use serde_json::Value;
use tracing::{error, info, warn};

use crate::request::{ApiClient, ApiError};

/// Key filter requested for search pages.
pub const SEARCH_AT: &str = "results,pagination,options.is_partial";

/// loc.gov stops serving search results past this count.
pub const SEARCH_RESULT_LIMIT: u64 = 100_000;

/// Extra results fetched beyond a requested cap, to cover entries that the
/// non-item filter removes afterwards.
const RESULT_CAP_BUFFER: usize = 10;

/// Options for [`express_search`].
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Results per page (`c` parameter). `None` uses the loc.gov default,
    /// which varies by collection. Large values make the JSON slow and can
    /// get it truncated.
    pub per_page: Option<u32>,
    /// Return only the top `limit` results; zero returns everything.
    pub limit: usize,
    /// Filter out non-items (events, collection pages, research centers).
    pub only_items: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            per_page: None,
            limit: 0,
            only_items: true,
        }
    }
}

/// Fetches all results for a loc.gov search URL, page by page.
///
/// Each page is requested through the client's full retry policy. Errors on
/// the first page are returned; errors on later pages end the loop and the
/// partial set collected so far is returned, with the shortfall logged.
///
/// Searches larger than the loc.gov system limit are logged and continued:
/// the API serves what it will and this function collects it. (The upstream
/// behavior of pausing for operator confirmation does not fit a library.)
///
/// # Errors
///
/// Returns the underlying [`ApiError`] when the first page cannot be
/// fetched.
pub async fn express_search(
    client: &ApiClient,
    search_url: &str,
    options: &SearchOptions,
) -> Result<Vec<Value>, ApiError> {
    let mut results: Vec<Value> = Vec::new();
    let mut records_expected: u64 = 0;
    let per_page = options.per_page.map(|c| c.to_string());

    info!(url = %search_url, "starting search");

    let mut page: u64 = 1;
    loop {
        let sp = page.to_string();
        let mut params: Vec<(&str, &str)> =
            vec![("fo", "json"), ("at", SEARCH_AT), ("sp", &sp)];
        if let Some(c) = per_page.as_deref() {
            params.push(("c", c));
        }

        info!(page, "requesting search page");
        let response = match client.get_locgov_json(search_url, &params).await {
            Ok(response) => response,
            Err(e) if page == 1 => {
                error!(error = %e, "search failed on the first page");
                return Err(e);
            }
            Err(e) => {
                // The loop stops requesting pages when it hits an error. For
                // searches past the system limit this happens early.
                if records_expected > 0 && (results.len() as u64) < records_expected {
                    error!(
                        expected = records_expected,
                        collected = results.len(),
                        error = %e,
                        "search ended before all expected results were collected"
                    );
                }
                break;
            }
        };

        if page == 1 {
            match response.pointer("/pagination/of").and_then(Value::as_u64) {
                Some(expected) => {
                    records_expected = expected;
                    info!(expected, "total records reported by first page");
                    if expected > SEARCH_RESULT_LIMIT {
                        error!(
                            expected,
                            limit = SEARCH_RESULT_LIMIT,
                            "search exceeds the loc.gov result limit; only the served \
                             portion will be collected"
                        );
                    }
                }
                None => {
                    error!("could not read expected record count from pagination section");
                }
            }
        }

        match response.get("results").and_then(Value::as_array) {
            Some(page_results) => results.extend(page_results.iter().cloned()),
            None => warn!(page, "page had no results list"),
        }

        // Stop early once the cap (plus filter buffer) is satisfied.
        if options.limit > 0 && results.len() >= options.limit + RESULT_CAP_BUFFER {
            info!(limit = options.limit, "stopping early at requested result cap");
            break;
        }

        match response
            .pointer("/pagination/total")
            .and_then(Value::as_u64)
        {
            Some(pages_expected) if page >= pages_expected => break,
            Some(_) => {}
            None => {
                error!("could not read expected page count from pagination section; stopping");
                break;
            }
        }
        page += 1;
    }

    let before_filtering = results.len();
    if options.only_items {
        results.retain(is_item_or_resource);
    }
    let removed = before_filtering - results.len();

    if options.limit > 0 {
        if results.len() < options.limit {
            warn!(
                requested = options.limit,
                available = results.len(),
                "fewer results than the requested cap after filtering"
            );
        } else {
            results.truncate(options.limit);
        }
    }

    info!(
        collected = before_filtering,
        expected = records_expected,
        removed_non_items = removed,
        returned = results.len(),
        "search finished"
    );
    if results.is_empty() {
        error!(url = %search_url, "search returned no results");
    }

    Ok(results)
}

/// Whether a search result entry points at a loc.gov item or resource.
fn is_item_or_resource(result: &Value) -> bool {
    result
        .get("url")
        .and_then(Value::as_str)
        .is_some_and(|url| url.contains("/item/") || url.contains("/resource/"))
}
