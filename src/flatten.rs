//! JSON flattening for tabular export.
//!
//! loc.gov records are deeply nested JSON; CSV wants one level of unique
//! keys. [`flatten_value`] unfolds a record into dotted key paths
//! (`item.date`, `resources.0.url`), with escape hatches for subtrees that
//! should stay whole. [`flatten_records`] applies the profile used for
//! published loc.gov data packages.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

/// Controls for [`flatten_value`].
#[derive(Debug, Clone, Default)]
pub struct FlattenOptions {
    /// Keys left unflattened wherever they appear.
    pub donotparse: Vec<String>,
    /// Flattened-key-path prefixes left unflattened. Anchor patterns with `^`
    /// to match from the start of the dotted path.
    pub donotparse_regex: Vec<Regex>,
    /// Whether lists are expanded into `key.0`, `key.1`, ... entries.
    /// When false a list stays whole in a single cell.
    pub parse_lists: bool,
}

impl FlattenOptions {
    /// Options that expand everything.
    #[must_use]
    pub fn expand_all() -> Self {
        Self {
            donotparse: Vec::new(),
            donotparse_regex: Vec::new(),
            parse_lists: true,
        }
    }
}

/// Keys that are facet filter links (or duplicates) in loc.gov records;
/// expanding them explodes the column count without adding information.
const LOCGOV_DONOTPARSE: &[&str] = &[
    "contributors",
    "locations",
    "subjects",
    "partof",
    "more_list_this",
];

static LOCGOV_DONOTPARSE_REGEX: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    // resources.N.files.M holds per-segment file groups; item.item duplicates
    // the item record.
    [r"^resources\.\d+\.files\.\d+", r"^item\.item"]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
});

/// The flattening profile for loc.gov item records and search results.
#[must_use]
pub fn locgov_flatten_options() -> FlattenOptions {
    FlattenOptions {
        donotparse: LOCGOV_DONOTPARSE.iter().map(ToString::to_string).collect(),
        donotparse_regex: LOCGOV_DONOTPARSE_REGEX.clone(),
        parse_lists: false,
    }
}

/// Flattens a JSON value into a single-level map with dotted key paths.
///
/// Keys are unique in the output by construction; a later duplicate path
/// overwrites an earlier one, mirroring plain map insertion.
#[must_use]
pub fn flatten_value(record: &Value, options: &FlattenOptions) -> Map<String, Value> {
    let mut out = Map::new();
    flatten_into(record, "", options, &mut out);
    out
}

/// Flattens a batch of loc.gov records with [`locgov_flatten_options`].
///
/// Accepts full item records or search result entries.
#[must_use]
pub fn flatten_records(records: &[Value]) -> Vec<Map<String, Value>> {
    let options = locgov_flatten_options();
    debug!(records = records.len(), "flattening records");
    records
        .iter()
        .map(|record| flatten_value(record, &options))
        .collect()
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn flatten_into(record: &Value, prefix: &str, options: &FlattenOptions, out: &mut Map<String, Value>) {
    if !prefix.is_empty()
        && options
            .donotparse_regex
            .iter()
            .any(|pattern| pattern.is_match(prefix))
    {
        out.insert(prefix.to_string(), record.clone());
        return;
    }

    match record {
        Value::Object(fields) => {
            for (key, value) in fields {
                let child = join_key(prefix, key);
                if options.donotparse.iter().any(|stop| stop == key) {
                    out.insert(child, value.clone());
                    continue;
                }
                match value {
                    Value::Array(items) => {
                        if options.parse_lists {
                            for (index, item) in items.iter().enumerate() {
                                flatten_into(item, &format!("{child}.{index}"), options, out);
                            }
                        } else {
                            out.insert(child, value.clone());
                        }
                    }
                    Value::Object(_) => flatten_into(value, &child, options, out),
                    _ => {
                        out.insert(child, value.clone());
                    }
                }
            }
        }
        Value::Array(items) => {
            if options.parse_lists {
                for (index, item) in items.iter().enumerate() {
                    flatten_into(item, &join_key(prefix, &index.to_string()), options, out);
                }
            } else {
                out.insert(prefix.to_string(), record.clone());
            }
        }
        _ => {
            out.insert(prefix.to_string(), record.clone());
        }
    }
}
