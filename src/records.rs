//! Bulk harvest orchestration for loc.gov records.
//!
//! [`LocGovRecords`] drives the whole pipeline: run a search (or load ids
//! from a CSV), fetch each item record once, parse its resources and file
//! listings into tables, and save everything as CSV plus an error ledger.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::download::{DownloadJob, DownloadReport, dest_path, download_jobs, verify_media_type};
use crate::flatten::flatten_records;
use crate::request::ApiClient;
use crate::search::{SearchOptions, express_search};
use crate::table::{Table, TableError};

/// Resource-level fields that can hold a downloadable file URL.
///
/// `fulltext_*` and `*_text_file` carry OCR output in various packagings;
/// `image` is the thumbnail or IIIF derivative; the rest are audio/video
/// delivery variants.
pub const TOP_LEVEL_FILE_FIELDS: &[&str] = &[
    "fulltext_derivative",
    "text_file",
    "djvu_text_file",
    "djvu_xml_file",
    "fulltext_file",
    "word_coordinates",
    "image",
    "pdf",
    "closed_captions",
    "poster",
    "video",
    "video_stream",
    "background",
    "info",
    "media",
    "audio",
];

/// `item.*` columns placed right after the non-item columns in items.csv.
const PREFERRED_ITEM_COLUMNS: &[&str] = &[
    "item.resources",
    "item.digitized",
    "item.number_lccn",
    "item.number_fileID",
    "item.number_uuid",
    "item.online_format",
    "item.mime_type",
    "item.partof",
    "item.group",
];

/// Fields that may hold a segment file's download URL, least preferred first.
const SEGMENT_URL_FIELDS: &[&str] = &["word_coordinates", "fulltext_service", "url"];

/// Matches the scheme+host of any loc.gov URL, for environment rebasing.
static LOC_BASE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^https?://(?:[^/]*\.)?loc\.gov/").ok());

/// Captures the `sp=` segment number in a resource URL query string.
static SEGMENT_SP: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"sp=(\d+)").ok());

/// Which loc.gov environment to harvest from. Only prod is public.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// `https://www.loc.gov/`
    #[default]
    Prod,
    /// `https://test.loc.gov/`
    Test,
    /// `https://dev.loc.gov/`
    Dev,
}

impl Environment {
    /// Base URL for this environment, with trailing slash.
    #[must_use]
    pub fn base_url(self) -> &'static str {
        match self {
            Self::Prod => "https://www.loc.gov/",
            Self::Test => "https://test.loc.gov/",
            Self::Dev => "https://dev.loc.gov/",
        }
    }

    /// Parses an environment name, falling back to prod with a logged error
    /// for unknown values.
    #[must_use]
    pub fn parse_lenient(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "prod" => Self::Prod,
            "test" => Self::Test,
            "dev" => Self::Dev,
            other => {
                error!(environment = other, "not one of prod, dev, or test; using prod");
                Self::Prod
            }
        }
    }
}

/// Where the ids come from.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// A loc.gov search URL, e.g. `https://www.loc.gov/search/?q=cook-book`.
    Search(String),
    /// A CSV file with an `item_id` or `resource_id` column holding LCCNs or
    /// loc.gov URLs.
    Csv(PathBuf),
}

/// Harvest configuration.
#[derive(Debug, Clone)]
pub struct HarvestOptions {
    /// Directory for CSV outputs and downloads.
    pub output_dir: PathBuf,
    /// Prefix for output filenames.
    pub output_prefix: String,
    /// Search results per page (`c` parameter).
    pub per_page: Option<u32>,
    /// Environment to harvest from.
    pub environment: Environment,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            output_prefix: String::new(),
            per_page: None,
            environment: Environment::Prod,
        }
    }
}

/// Errors from harvest setup and output writing.
///
/// Per-record request failures do not surface here; they are collected in the
/// [`ErrorLedger`] so one bad record cannot end a long harvest.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// The input CSV could not be loaded.
    #[error("could not load input CSV {path}: {source}")]
    InputCsv {
        /// The CSV path.
        path: PathBuf,
        /// The underlying table error.
        #[source]
        source: TableError,
    },

    /// The input CSV has no usable id column.
    #[error("input CSV has neither an item_id nor a resource_id column: {path}")]
    MissingIdColumn {
        /// The CSV path.
        path: PathBuf,
    },

    /// Writing an output CSV failed.
    #[error(transparent)]
    Table(#[from] TableError),

    /// Creating the output directory or writing errors.json failed.
    #[error("IO error for {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Serializing errors.json failed.
    #[error("could not serialize error ledger: {source}")]
    Json {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// One recorded per-record failure.
#[derive(Debug, Clone, Serialize)]
pub struct RecordError {
    /// The id or URL the failure belongs to.
    pub id: String,
    /// What went wrong.
    pub message: String,
}

/// Failures collected during a harvest, bucketed by stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorLedger {
    /// Search-stage failures.
    pub search: Vec<String>,
    /// Item-fetch failures.
    pub items: Vec<RecordError>,
    /// Resource-resolution failures.
    pub resources: Vec<RecordError>,
}

/// Orchestrates a loc.gov harvest: search, item fetch, parsing, and output.
#[derive(Debug)]
pub struct LocGovRecords {
    client: ApiClient,
    input: InputSource,
    options: HarvestOptions,
    base: String,
    /// Item ids to fetch; may also carry `resource_id` / `request_error`.
    pub item_ids: Table,
    /// Resource ids awaiting item-id resolution.
    pub resource_ids: Table,
    /// Resource ids that address a single segment (`?sp=N`).
    pub segment_ids: Table,
    /// Raw search results, unflattened.
    pub search_metadata_json: Vec<Value>,
    /// Flattened search results.
    pub search_metadata: Table,
    /// Flattened item records.
    pub items: Table,
    /// One row per resource of each item.
    pub resources: Table,
    /// Segment-level file listings.
    pub files_segments: Table,
    /// Resource-level file URLs (not attached to any segment).
    pub files_resources: Table,
    /// Failures recorded along the way.
    pub errors: ErrorLedger,
}

impl LocGovRecords {
    /// Creates a harvest. CSV inputs are loaded immediately; ids are rebased
    /// onto the selected environment.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError`] when a CSV input cannot be loaded or lacks an
    /// id column.
    pub fn new(
        client: ApiClient,
        input: InputSource,
        options: HarvestOptions,
    ) -> Result<Self, HarvestError> {
        let base = options.environment.base_url().to_string();
        let mut records = Self {
            client,
            input,
            options,
            base,
            item_ids: Table::new(),
            resource_ids: Table::new(),
            segment_ids: Table::new(),
            search_metadata_json: Vec::new(),
            search_metadata: Table::new(),
            items: Table::new(),
            resources: Table::new(),
            files_segments: Table::new(),
            files_resources: Table::new(),
            errors: ErrorLedger::default(),
        };

        if let InputSource::Csv(path) = records.input.clone() {
            records.load_csv(&path)?;
        }
        records.apply_environment();
        Ok(records)
    }

    /// Returns the client, e.g. to check the blocked flag after a run.
    #[must_use]
    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    fn load_csv(&mut self, path: &Path) -> Result<(), HarvestError> {
        let input = Table::from_csv_path(path).map_err(|source| HarvestError::InputCsv {
            path: path.to_path_buf(),
            source,
        })?;

        if input.has_column("item_id") {
            self.item_ids = keep_column(&input, "item_id");
        } else if input.has_column("resource_id") {
            self.resource_ids = keep_column(&input, "resource_id");
        } else {
            error!(path = %path.display(), "input CSV has no item_id or resource_id column");
            return Err(HarvestError::MissingIdColumn {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Rewrites collected ids and the search URL onto the selected
    /// environment's base. Safe to run repeatedly during a harvest.
    fn apply_environment(&mut self) {
        let base = self.base.clone();
        let rebase = |value: &Value| match value.as_str() {
            Some(text) => json!(rebase_loc_url(text, &base)),
            None => value.clone(),
        };
        self.item_ids.map_column("item_id", rebase);
        self.resource_ids.map_column("resource_id", rebase);
        self.segment_ids.map_column("segment_id", rebase);

        if let InputSource::Search(url) = &mut self.input {
            if let Some(pattern) = LOC_BASE.as_ref() {
                *url = pattern.replace(url.as_str(), base.as_str()).into_owned();
            }
        }
    }

    /// Turns an id or URL into a normalized loc.gov URL in the selected
    /// environment, with a trailing slash.
    ///
    /// `98687169` with prefix `item/` becomes
    /// `https://www.loc.gov/item/98687169/`; loc.gov URLs keep their path but
    /// get the environment base.
    fn normalize_record_url(&self, id: &str, prefix: &str) -> String {
        let mut url = if is_url(id) {
            rebase_loc_url(id, &self.base)
        } else {
            format!("{}{}{}", self.base, prefix, id)
        };
        if !url.ends_with('/') {
            url.push('/');
        }
        url
    }

    /// Runs the loc.gov search and splits the results into item, resource,
    /// and segment id lists.
    ///
    /// Returns whether the search ran and found results. Failures are logged
    /// and recorded in the ledger.
    pub async fn get_search(&mut self, limit: usize) -> bool {
        let InputSource::Search(url) = self.input.clone() else {
            error!("input type is not a search; search not executed");
            return false;
        };

        let search_options = SearchOptions {
            per_page: self.options.per_page,
            limit,
            only_items: true,
        };
        let results = match express_search(&self.client, &url, &search_options).await {
            Ok(results) => results,
            Err(e) => {
                let message = format!("search failed for {url}: {e}");
                error!("{message}");
                self.errors.search.push(message);
                return false;
            }
        };

        self.search_metadata_json.clone_from(&results);
        if results.is_empty() {
            self.errors
                .search
                .push(format!("search returned no results after filters: {url}"));
            return false;
        }

        self.search_metadata = Table::from_rows(flatten_records(&results));

        for row in self.search_metadata.rows() {
            let Some(id) = row.get("id").and_then(Value::as_str) else {
                continue;
            };
            if id.contains("/item/") {
                self.item_ids.push_row(single_cell("item_id", id));
            } else if id.contains("/resource/") {
                self.resource_ids.push_row(single_cell("resource_id", id));
                let is_segment = id.contains('?')
                    && SEGMENT_SP.as_ref().is_some_and(|re| re.is_match(id));
                if is_segment {
                    self.segment_ids.push_row(single_cell("segment_id", id));
                }
            }
        }

        self.apply_environment();
        true
    }

    /// Fetches resource records to learn their item ids, extending
    /// `item_ids` with one row per resource (carrying the resource URL so
    /// item parsing can filter to the targeted resource).
    async fn resolve_item_ids_from_resources(&mut self) {
        info!("requesting resource records to get item ids");

        for row in self.resource_ids.rows().to_vec() {
            let Some(resource_id) = row
                .get("resource_id")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|id| !id.is_empty())
            else {
                continue;
            };

            let mut handle = Map::new();
            handle.insert("request_error".to_string(), Value::Null);

            if resource_id.contains("http") && !resource_id.contains("/resource/") {
                error!(resource_id, "not a loc.gov resource; skipping");
                handle.insert("resource_id".to_string(), json!(resource_id));
                handle.insert(
                    "request_error".to_string(),
                    json!("not a loc.gov resource URL; item lookup skipped"),
                );
                self.item_ids.push_row(handle);
                continue;
            }

            let resource_url = self.normalize_record_url(resource_id, "resource/");
            handle.insert("resource_id".to_string(), json!(resource_url));

            match self
                .client
                .get_locgov_json(&resource_url, &[("fo", "json"), ("at", "item.id,options.is_partial")])
                .await
            {
                Ok(response) => match response.get("item.id").and_then(Value::as_str) {
                    Some(item_id) => {
                        handle.insert("item_id".to_string(), json!(item_id));
                    }
                    None => {
                        error!(url = %resource_url, "resource record carries no item id");
                        handle.insert(
                            "request_error".to_string(),
                            json!("could not retrieve the item id from the resource record"),
                        );
                    }
                },
                Err(e) => {
                    self.errors.resources.push(RecordError {
                        id: resource_url.clone(),
                        message: e.to_string(),
                    });
                    handle.insert("request_error".to_string(), json!(format!("{e}")));
                }
            }

            self.item_ids.push_row(handle);
        }

        self.apply_environment();
        info!("done getting item ids from resource ids");
    }

    /// Fetches item records for every collected id and parses them into the
    /// `items`, `resources`, `files_segments`, and `files_resources` tables.
    ///
    /// Items referenced by several resources are fetched once and reused.
    /// Returns whether the run completed without item-level request errors
    /// (which are recorded in the ledger either way).
    pub async fn get_items(&mut self) -> bool {
        info!("downloading item records from loc.gov");
        let mut no_errors = true;

        if !self.resource_ids.is_empty() {
            self.resolve_item_ids_from_resources().await;
        }

        if self.item_ids.is_empty() {
            error!(
                "no item or resource ids collected; run get_search() first, or check that \
                 the input CSV has values in its item_id or resource_id column"
            );
            return false;
        }

        let mut items_json: Vec<Value> = Vec::new();
        let mut fetched: HashMap<String, Map<String, Value>> = HashMap::new();
        let mut resource_rows: Vec<Map<String, Value>> = Vec::new();
        let mut files_segment_rows: Vec<Map<String, Value>> = Vec::new();
        let mut files_resource_rows: Vec<Map<String, Value>> = Vec::new();

        for row in self.item_ids.rows().to_vec() {
            let mut item = row.clone();
            if !item.contains_key("request_error") {
                item.insert("request_error".to_string(), Value::Null);
            }

            // The resource this row came from, when the input was a resource
            // list; `?sp=N` addresses a single segment of it.
            let target_resource = row
                .get("resource_id")
                .and_then(Value::as_str)
                .map(ToString::to_string);
            let target_resource_id = target_resource
                .as_deref()
                .map(|r| r.split_once('?').map_or(r, |(head, _)| head).to_string());
            let segment_sp: Option<u64> = target_resource
                .as_deref()
                .and_then(|r| r.split_once('?'))
                .and_then(|(_, query)| SEGMENT_SP.as_ref()?.captures(query))
                .and_then(|captures| captures.get(1))
                .and_then(|m| m.as_str().parse().ok());

            let Some(item_id_raw) = row
                .get("item_id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(ToString::to_string)
            else {
                error!("skipping a row with no item id");
                items_json.push(Value::Object(item));
                continue;
            };

            if item_id_raw.contains("http") && !item_id_raw.contains("/item/") {
                error!(item_id = %item_id_raw, "not a loc.gov item; skipping");
                item.insert(
                    "request_error".to_string(),
                    json!("not a loc.gov item id; item request skipped"),
                );
                items_json.push(Value::Object(item));
                continue;
            }

            let item_url = self.normalize_record_url(&item_id_raw, "item/");
            item.insert("item_id".to_string(), json!(item_url));

            // Fetch once per item; further resources of the same item reuse
            // the cached record.
            let response = if let Some(cached) = fetched.get(&item_url) {
                cached.clone()
            } else {
                match self
                    .client
                    .get_locgov_json(
                        &item_url,
                        &[("fo", "json"), ("at", "item,resources,options.is_partial")],
                    )
                    .await
                {
                    Ok(Value::Object(body)) => {
                        fetched.insert(item_url.clone(), body.clone());
                        body
                    }
                    Ok(_) => {
                        item.insert(
                            "request_error".to_string(),
                            json!("item record was not a JSON object"),
                        );
                        no_errors = false;
                        items_json.push(Value::Object(item));
                        continue;
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            "resources and files will not be parsed because the item \
                             record could not be retrieved"
                        );
                        item.insert("request_error".to_string(), json!(e.to_string()));
                        no_errors = false;
                        items_json.push(Value::Object(item));
                        continue;
                    }
                }
            };

            for (key, value) in &response {
                if !matches!(key.as_str(), "item_id" | "resource_id" | "request_error") {
                    item.insert(key.clone(), value.clone());
                }
            }

            let raw_resources = item
                .get("resources")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if raw_resources.is_empty() {
                let message = format!(
                    "item record has no resources key: {item_url}; skipping parsing of \
                     resources and files"
                );
                info!("{message}");
                self.errors.items.push(RecordError {
                    id: item_url.clone(),
                    message,
                });
                items_json.push(Value::Object(item));
                continue;
            }

            for resource in &raw_resources {
                let Some(resource_obj) = resource.as_object() else {
                    continue;
                };

                let resource_url = resource_obj.get("url").and_then(Value::as_str).map(|u| {
                    let mut url = u.to_string();
                    if !url.ends_with('/') {
                        url.push('/');
                    }
                    url
                });

                // A targeted resource from the input skips this item's other
                // resources.
                if let Some(target) = target_resource_id.as_deref() {
                    if resource_url.as_deref() != Some(target) {
                        continue;
                    }
                }

                let segment_count = resource_obj
                    .get("files")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);

                let mut resource_row = Map::new();
                resource_row.insert("item_id".to_string(), json!(item_url));
                resource_row.insert(
                    "resource_input_url".to_string(),
                    target_resource.as_deref().map_or(Value::Null, |t| json!(t)),
                );
                resource_row.insert("segment_count".to_string(), json!(segment_count));
                resource_row.insert(
                    "resource_id".to_string(),
                    resource_url.as_deref().map_or(Value::Null, |u| json!(u)),
                );
                for (key, value) in resource_obj {
                    if key != "files" {
                        resource_row.insert(key.clone(), value.clone());
                    }
                }

                for field in TOP_LEVEL_FILE_FIELDS {
                    let Some(value) = resource_obj.get(*field) else {
                        continue;
                    };
                    if value.is_null() || value.as_str().is_some_and(str::is_empty) {
                        continue;
                    }
                    let mut file_row = Map::new();
                    file_row.insert("item_id".to_string(), json!(item_url));
                    file_row.insert(
                        "resource_id".to_string(),
                        resource_url.as_deref().map_or(Value::Null, |u| json!(u)),
                    );
                    file_row.insert("source_field".to_string(), json!(field));
                    file_row.insert("url".to_string(), value.clone());
                    files_resource_rows.push(file_row);
                }

                if let Some(file_groups) = resource_obj.get("files").and_then(Value::as_array) {
                    for (segment_index, group) in file_groups.iter().enumerate() {
                        // When the input addressed one segment, keep only it.
                        if let Some(sp) = segment_sp {
                            if segment_index as u64 + 1 != sp {
                                continue;
                            }
                        }
                        let Some(group) = group.as_array() else {
                            continue;
                        };
                        for (file_index, file) in group.iter().enumerate() {
                            let Some(file_obj) = file.as_object() else {
                                continue;
                            };
                            let mut file_row = Map::new();
                            file_row.insert("item_id".to_string(), json!(item_url));
                            file_row.insert(
                                "resource_input_url".to_string(),
                                target_resource.as_deref().map_or(Value::Null, |t| json!(t)),
                            );
                            file_row.insert(
                                "resource_id".to_string(),
                                resource_url.as_deref().map_or(Value::Null, |u| json!(u)),
                            );
                            file_row.insert("segment_num".to_string(), json!(segment_index));
                            file_row.insert("file_num".to_string(), json!(file_index));
                            file_row.insert(
                                "mimetype".to_string(),
                                file_obj.get("mimetype").cloned().unwrap_or(Value::Null),
                            );
                            file_row.insert(
                                "url".to_string(),
                                file_obj.get("url").cloned().unwrap_or(Value::Null),
                            );
                            for (key, value) in file_obj {
                                if !matches!(key.as_str(), "mimetype" | "url") {
                                    file_row.insert(key.clone(), value.clone());
                                }
                            }
                            files_segment_rows.push(file_row);
                        }
                    }
                }

                resource_rows.push(resource_row);
            }

            items_json.push(Value::Object(item));
        }

        let mut items = Table::from_rows(flatten_records(&items_json));

        items.add_column_with("resource_count", |row| {
            json!(
                row.get("item.resources")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len)
            )
        });
        items.add_column_with("segment_count", |row| {
            // item.resources entries carry `files` as a segment count; the
            // full resources listing carries it as the nested file groups.
            let segments: u64 = row
                .get("item.resources")
                .and_then(Value::as_array)
                .map_or(0, |resources| {
                    resources
                        .iter()
                        .filter_map(|resource| resource.get("files"))
                        .map(|files| {
                            files.as_u64().unwrap_or_else(|| {
                                files.as_array().map_or(0, Vec::len) as u64
                            })
                        })
                        .sum()
                });
            json!(segments)
        });
        if let Err(e) = items.move_column("resource_count", 3) {
            debug!(error = %e, "resource_count column placement skipped");
        }
        items.rename_column("resource_id", "resource_input_url");
        let order = item_column_order(items.columns());
        items.set_column_order(&order);
        // The raw resources JSON makes CSVs unmanageable when file lists are
        // long; everything in it is parsed into the other tables.
        items.drop_column("resources");

        for row in items.rows() {
            if let Some(message) = row.get("request_error").and_then(Value::as_str) {
                self.errors.items.push(RecordError {
                    id: row
                        .get("item_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    message: message.to_string(),
                });
            }
        }

        self.items = items;
        info!("updated: .items");
        self.resources = Table::from_rows(resource_rows);
        info!("updated: .resources");
        self.files_resources = Table::from_rows(files_resource_rows);
        info!("updated: .files_resources");
        self.files_segments = Table::from_rows(files_segment_rows);
        info!("updated: .files_segments");

        no_errors
    }

    /// Downloads segment-level files whose `mimetype` matches one of the
    /// validated `media_types`, into `<dest>/files_segments/`.
    ///
    /// `dest` defaults to the harvest output directory. Requires
    /// [`get_items`](Self::get_items) to have populated `files_segments`.
    pub async fn download_files_segments(
        &self,
        media_types: &[String],
        dest: Option<&Path>,
    ) -> DownloadReport {
        info!("preparing to download segment-level files");

        let validated: Vec<&str> = media_types
            .iter()
            .map(String::as_str)
            .filter(|media_type| verify_media_type(media_type))
            .collect();
        if validated.is_empty() {
            error!("no media types validated; cannot download files");
            return DownloadReport::default();
        }

        if self.files_segments.is_empty() {
            warn!(
                "there are no segment files listed; did you forget to run get_items(), or \
                 could there be no segment files for your items?"
            );
            return DownloadReport::default();
        }

        let selected = self.files_segments.filter(|row| {
            row.get("mimetype")
                .and_then(Value::as_str)
                .is_some_and(|mimetype| validated.contains(&mimetype))
        });
        if selected.is_empty() {
            warn!("no segment files match the validated media types; skipping");
            return DownloadReport::default();
        }

        info!(
            media_types = %validated.join(", "),
            files = selected.len(),
            "downloading segment files"
        );

        let dest_root = dest
            .unwrap_or(&self.options.output_dir)
            .join("files_segments");
        let mut jobs = Vec::new();
        let mut unsourced = 0usize;
        for row in selected.rows() {
            // The download URL may sit in several fields; the last present
            // field in SEGMENT_URL_FIELDS wins.
            let mut src: Option<&str> = None;
            for field in SEGMENT_URL_FIELDS {
                if let Some(value) = row
                    .get(*field)
                    .and_then(Value::as_str)
                    .filter(|v| !v.is_empty())
                {
                    src = Some(value);
                }
            }
            match src {
                Some(src) => jobs.push(DownloadJob {
                    src: src.to_string(),
                    dest: dest_path(src, &dest_root),
                }),
                None => unsourced += 1,
            }
        }
        if unsourced > 0 {
            error!(
                files = unsourced,
                fields = %SEGMENT_URL_FIELDS.join(", "),
                "files had no download URL in any known field; skipping them"
            );
        }

        let mut report = download_jobs(&self.client, &jobs, false).await;
        for _ in 0..unsourced {
            report.record_skipped("unknown (no download URL found)", None);
        }
        report
    }

    /// Downloads resource-level files whose `source_field` is one of `keys`
    /// (see [`TOP_LEVEL_FILE_FIELDS`]), into `<dest>/files_resources/`.
    ///
    /// `dest` defaults to the harvest output directory. Requires
    /// [`get_items`](Self::get_items) to have populated `files_resources`.
    pub async fn download_files_resources(
        &self,
        keys: &[String],
        dest: Option<&Path>,
    ) -> DownloadReport {
        info!("preparing to download resource-level files");

        let mut validated: Vec<&str> = Vec::new();
        for key in keys {
            if TOP_LEVEL_FILE_FIELDS.contains(&key.as_str()) {
                validated.push(key.as_str());
            } else {
                error!(field = %key, "not a recognized resource-level file field; skipping");
            }
        }
        if validated.is_empty() {
            error!("no file fields validated; cannot download files");
            return DownloadReport::default();
        }

        if self.files_resources.is_empty() {
            warn!(
                "there are no resource files listed; did you forget to run get_items(), or \
                 could there be no resource files for your items?"
            );
            return DownloadReport::default();
        }

        let selected = self.files_resources.filter(|row| {
            row.get("source_field")
                .and_then(Value::as_str)
                .is_some_and(|field| validated.contains(&field))
        });
        if selected.is_empty() {
            warn!("no resource-level files match the validated fields; skipping");
            return DownloadReport::default();
        }

        info!(
            fields = %validated.join(", "),
            files = selected.len(),
            "downloading resource files"
        );

        let dest_root = dest
            .unwrap_or(&self.options.output_dir)
            .join("files_resources");
        let jobs: Vec<DownloadJob> = selected
            .rows()
            .iter()
            .filter_map(|row| row.get("url").and_then(Value::as_str))
            .map(|src| DownloadJob {
                src: src.to_string(),
                dest: dest_path(src, &dest_root),
            })
            .collect();

        download_jobs(&self.client, &jobs, false).await
    }

    /// The full non-programmer pipeline: search (when the input is a search),
    /// fetch items, and save every output CSV plus the error ledger.
    ///
    /// `limit` caps search results at the top n (zero takes everything);
    /// `get_items` controls whether item records are fetched after a search
    /// (CSV inputs always fetch items).
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError`] only for output-writing failures; request
    /// failures land in the ledger.
    pub async fn get_records(
        &mut self,
        get_items: bool,
        limit: usize,
        save: bool,
    ) -> Result<(), HarvestError> {
        self.apply_environment();

        let mut fetch_items = get_items || matches!(self.input, InputSource::Csv(_));
        if matches!(self.input, InputSource::Search(_)) {
            let found = self.get_search(limit).await;
            debug!(found, "search outcome");
            if !found {
                fetch_items = false;
            }
        }

        if fetch_items {
            let clean = self.get_items().await;
            debug!(clean, "getting items finished");
        }

        if save {
            self.save_outputs(fetch_items)?;
        }
        Ok(())
    }

    /// Writes the collected tables into the output directory.
    ///
    /// Saves `search.csv` when a search ran, and (when items were fetched)
    /// `items.csv`, `resources.csv`, `files_segments.csv`,
    /// `files_resources.csv`, and `errors.json`, all with the configured
    /// filename prefix.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError`] when the directory or a file cannot be
    /// written.
    pub fn save_outputs(&self, include_items: bool) -> Result<(), HarvestError> {
        let output_dir = &self.options.output_dir;
        std::fs::create_dir_all(output_dir).map_err(|source| HarvestError::Io {
            path: output_dir.clone(),
            source,
        })?;
        let prefix = &self.options.output_prefix;

        if self.search_metadata.is_empty() {
            warn!("skipping search.csv, no records to save");
        } else {
            self.search_metadata
                .write_csv(&output_dir.join(format!("{prefix}search.csv")), false)?;
        }

        if include_items {
            if self.items.is_empty() {
                warn!("skipping items.csv, no records to save");
            } else {
                self.items
                    .write_csv(&output_dir.join(format!("{prefix}items.csv")), false)?;
            }
            self.resources
                .write_csv(&output_dir.join(format!("{prefix}resources.csv")), false)?;
            self.files_segments.write_csv(
                &output_dir.join(format!("{prefix}files_segments.csv")),
                false,
            )?;
            self.files_resources.write_csv(
                &output_dir.join(format!("{prefix}files_resources.csv")),
                false,
            )?;

            let errors_path = output_dir.join(format!("{prefix}errors.json"));
            let errors_file =
                std::fs::File::create(&errors_path).map_err(|source| HarvestError::Io {
                    path: errors_path.clone(),
                    source,
                })?;
            serde_json::to_writer_pretty(errors_file, &self.errors)
                .map_err(|source| HarvestError::Json { source })?;
            info!(path = %errors_path.display(), "errors saved");
        }

        Ok(())
    }
}

/// Whether the input parses as an http(s) URL. False for other schemes.
#[must_use]
pub fn is_url(candidate: &str) -> bool {
    url::Url::parse(candidate)
        .map(|parsed| {
            matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
        })
        .unwrap_or(false)
}

/// Rewrites the scheme+host of a loc.gov URL onto `base`; other URLs pass
/// through unchanged.
fn rebase_loc_url(url: &str, base: &str) -> String {
    match LOC_BASE.as_ref() {
        Some(pattern) => pattern.replace(url, base).into_owned(),
        None => url.to_string(),
    }
}

fn single_cell(column: &str, value: &str) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert(column.to_string(), json!(value));
    row
}

fn keep_column(input: &Table, column: &str) -> Table {
    let mut table = Table::new();
    for row in input.rows() {
        if let Some(value) = row.get(column) {
            let mut kept = Map::new();
            kept.insert(column.to_string(), value.clone());
            table.push_row(kept);
        }
    }
    table
}

/// items.csv column order: non-`item.` columns first, the preferred `item.*`
/// fields next, remaining `item.*` columns alphabetical.
fn item_column_order(columns: &[String]) -> Vec<String> {
    let mut order: Vec<String> = columns
        .iter()
        .filter(|column| !column.starts_with("item."))
        .cloned()
        .collect();
    order.extend(
        PREFERRED_ITEM_COLUMNS
            .iter()
            .filter(|preferred| columns.iter().any(|c| c == *preferred))
            .map(ToString::to_string),
    );
    let mut rest: Vec<String> = columns
        .iter()
        .filter(|column| {
            column.starts_with("item.") && !PREFERRED_ITEM_COLUMNS.contains(&column.as_str())
        })
        .cloned()
        .collect();
    rest.sort();
    order.extend(rest);
    order
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::request::ClientOptions;
    use std::time::Duration;

    fn fast_client() -> ApiClient {
        ApiClient::with_options(&ClientOptions {
            user_agent: None,
            pause: Duration::ZERO,
            max_attempts: 2,
        })
        .unwrap()
    }

    fn search_records(url: &str) -> LocGovRecords {
        LocGovRecords::new(
            fast_client(),
            InputSource::Search(url.to_string()),
            HarvestOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_is_url() {
        assert!(is_url("https://www.loc.gov/item/98687169/"));
        assert!(is_url("http://loc.gov/item/98687169"));
        assert!(!is_url("98687169"));
        assert!(!is_url("ftp://loc.gov/file"));
        assert!(!is_url("g3732a.np000045"));
    }

    #[test]
    fn test_normalize_record_url_from_bare_ids() {
        let records = search_records("https://www.loc.gov/search/?q=x");
        assert_eq!(
            records.normalize_record_url("98687169", "item/"),
            "https://www.loc.gov/item/98687169/"
        );
        assert_eq!(
            records.normalize_record_url("g3732a.np000045", "resource/"),
            "https://www.loc.gov/resource/g3732a.np000045/"
        );
    }

    #[test]
    fn test_normalize_record_url_rebases_environments() {
        let records = search_records("https://www.loc.gov/search/?q=x");
        assert_eq!(
            records.normalize_record_url("http://loc.gov/item/98687169", "item/"),
            "https://www.loc.gov/item/98687169/"
        );
        assert_eq!(
            records.normalize_record_url("https://dev.loc.gov/item/98687169/", "item/"),
            "https://www.loc.gov/item/98687169/"
        );
    }

    #[test]
    fn test_dev_environment_base_applies_to_ids() {
        let records = LocGovRecords::new(
            fast_client(),
            InputSource::Search("https://www.loc.gov/search/?q=x".to_string()),
            HarvestOptions {
                environment: Environment::Dev,
                ..HarvestOptions::default()
            },
        )
        .unwrap();
        assert_eq!(
            records.normalize_record_url("https://www.loc.gov/item/1/", "item/"),
            "https://dev.loc.gov/item/1/"
        );
        match &records.input {
            InputSource::Search(url) => {
                assert_eq!(url, "https://dev.loc.gov/search/?q=x");
            }
            InputSource::Csv(_) => panic!("input should stay a search"),
        }
    }

    #[test]
    fn test_environment_parse_lenient_falls_back_to_prod() {
        assert_eq!(Environment::parse_lenient("dev"), Environment::Dev);
        assert_eq!(Environment::parse_lenient("TEST"), Environment::Test);
        assert_eq!(Environment::parse_lenient("staging"), Environment::Prod);
    }

    #[test]
    fn test_csv_input_requires_an_id_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.csv");
        std::fs::write(&path, "title\nsomething\n").unwrap();

        let result = LocGovRecords::new(
            fast_client(),
            InputSource::Csv(path),
            HarvestOptions::default(),
        );
        assert!(matches!(result, Err(HarvestError::MissingIdColumn { .. })));
    }

    #[test]
    fn test_csv_input_loads_item_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.csv");
        std::fs::write(
            &path,
            "item_id,notes\n98687169,first\nhttps://www.loc.gov/item/2021667925/,second\n",
        )
        .unwrap();

        let records = LocGovRecords::new(
            fast_client(),
            InputSource::Csv(path),
            HarvestOptions::default(),
        )
        .unwrap();
        assert_eq!(records.item_ids.len(), 2);
        assert_eq!(records.item_ids.columns(), ["item_id"]);
    }

    #[test]
    fn test_item_column_order() {
        let columns: Vec<String> = [
            "item.zebra",
            "item_id",
            "item.digitized",
            "request_error",
            "item.aardvark",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        let order = item_column_order(&columns);
        assert_eq!(
            order,
            [
                "item_id",
                "request_error",
                "item.digitized",
                "item.aardvark",
                "item.zebra"
            ]
        );
    }
}
