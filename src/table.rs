//! Row/column container for flattened records, with CSV sinks.
//!
//! This is deliberately not a data model: rows are the flattened JSON maps
//! produced by [`crate::flatten`], and the table only adds column bookkeeping
//! (first-seen order, renames, explicit ordering) plus CSV read/write. Cells
//! holding lists or objects are rendered as compact JSON so nothing is lost
//! on export.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from table CSV operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// File system error.
    #[error("IO error for {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// CSV encoding/decoding error.
    #[error("CSV error for {path}: {source}")]
    Csv {
        /// The path involved.
        path: PathBuf,
        /// The underlying CSV error.
        #[source]
        source: csv::Error,
    },

    /// A named column is not present in the table.
    #[error("column not found: {name}")]
    MissingColumn {
        /// The missing column name.
        name: String,
    },
}

/// A table of flattened records.
#[derive(Debug, Clone, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Map<String, Value>>,
}

impl Table {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from rows; columns are the union of row keys in
    /// first-seen order.
    #[must_use]
    pub fn from_rows(rows: Vec<Map<String, Value>>) -> Self {
        let mut table = Self::new();
        for row in rows {
            table.push_row(row);
        }
        table
    }

    /// Appends a row, registering any new columns in first-seen order.
    pub fn push_row(&mut self, row: Map<String, Value>) {
        for key in row.keys() {
            if !self.columns.iter().any(|column| column == key) {
                self.columns.push(key.clone());
            }
        }
        self.rows.push(row);
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names in output order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Whether a column exists.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column == name)
    }

    /// The rows, in insertion order.
    #[must_use]
    pub fn rows(&self) -> &[Map<String, Value>] {
        &self.rows
    }

    /// Returns a new table with the rows matching `predicate`.
    #[must_use]
    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> bool,
    {
        Self {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .filter(|row| predicate(row))
                .cloned()
                .collect(),
        }
    }

    /// Adds (or replaces) a column computed from each row.
    pub fn add_column_with<F>(&mut self, name: &str, compute: F)
    where
        F: Fn(&Map<String, Value>) -> Value,
    {
        if !self.has_column(name) {
            self.columns.push(name.to_string());
        }
        for row in &mut self.rows {
            let value = compute(row);
            row.insert(name.to_string(), value);
        }
    }

    /// Rewrites every present value of a column in place.
    pub fn map_column<F>(&mut self, name: &str, rewrite: F)
    where
        F: Fn(&Value) -> Value,
    {
        for row in &mut self.rows {
            if let Some(value) = row.get_mut(name) {
                *value = rewrite(value);
            }
        }
    }

    /// Renames a column in the header and in every row.
    pub fn rename_column(&mut self, from: &str, to: &str) {
        for column in &mut self.columns {
            if column == from {
                *column = to.to_string();
            }
        }
        for row in &mut self.rows {
            if let Some(value) = row.remove(from) {
                row.insert(to.to_string(), value);
            }
        }
    }

    /// Removes a column from the header and from every row.
    pub fn drop_column(&mut self, name: &str) {
        self.columns.retain(|column| column != name);
        for row in &mut self.rows {
            row.remove(name);
        }
    }

    /// Moves a column to the given index (clamped to the column count).
    ///
    /// # Errors
    ///
    /// Returns [`TableError::MissingColumn`] if the column does not exist.
    pub fn move_column(&mut self, name: &str, index: usize) -> Result<(), TableError> {
        let position = self
            .columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| TableError::MissingColumn {
                name: name.to_string(),
            })?;
        let column = self.columns.remove(position);
        self.columns.insert(index.min(self.columns.len()), column);
        Ok(())
    }

    /// Applies an explicit column order: listed-and-present columns first,
    /// then any remaining columns in their current order.
    pub fn set_column_order(&mut self, order: &[String]) {
        let mut new_columns: Vec<String> = order
            .iter()
            .filter(|name| self.has_column(name))
            .cloned()
            .collect();
        for column in &self.columns {
            if !new_columns.iter().any(|existing| existing == column) {
                new_columns.push(column.clone());
            }
        }
        self.columns = new_columns;
    }

    /// Loads a table from a CSV file; every cell becomes a JSON string and
    /// empty cells are left out of the row.
    ///
    /// # Errors
    ///
    /// Returns [`TableError`] when the file cannot be read or parsed.
    pub fn from_csv_path(path: &Path) -> Result<Self, TableError> {
        let mut reader = csv::Reader::from_path(path).map_err(|source| TableError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

        let columns: Vec<String> = reader
            .headers()
            .map_err(|source| TableError::Csv {
                path: path.to_path_buf(),
                source,
            })?
            .iter()
            .map(ToString::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|source| TableError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            let mut row = Map::new();
            for (column, cell) in columns.iter().zip(record.iter()) {
                if !cell.is_empty() {
                    row.insert(column.clone(), Value::String(cell.to_string()));
                }
            }
            rows.push(row);
        }

        debug!(path = %path.display(), rows = rows.len(), "loaded CSV");
        Ok(Self { columns, rows })
    }

    /// Writes the table to a CSV file.
    ///
    /// With `append` set and an existing file, rows are appended under the
    /// file's own header (cells rendered in that column order); otherwise the
    /// file is created or overwritten with this table's header.
    ///
    /// # Errors
    ///
    /// Returns [`TableError`] when the file cannot be written.
    pub fn write_csv(&self, path: &Path, append: bool) -> Result<(), TableError> {
        let csv_error = |source| TableError::Csv {
            path: path.to_path_buf(),
            source,
        };

        if append && path.is_file() {
            debug!(path = %path.display(), "appending to existing CSV");
            let existing_columns = Self::read_header(path)?;
            if existing_columns != self.columns {
                warn!(
                    path = %path.display(),
                    "existing CSV has a different column set; cells follow the file's header"
                );
            }
            let file = OpenOptions::new()
                .append(true)
                .open(path)
                .map_err(|source| TableError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            for row in &self.rows {
                let record: Vec<String> = existing_columns
                    .iter()
                    .map(|column| render_cell(row.get(column)))
                    .collect();
                writer.write_record(&record).map_err(csv_error)?;
            }
            writer.flush().map_err(|source| TableError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        } else {
            let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
            // A table with no columns still produces the (empty) file.
            if !self.columns.is_empty() {
                writer.write_record(&self.columns).map_err(csv_error)?;
            }
            for row in &self.rows {
                let record: Vec<String> = self
                    .columns
                    .iter()
                    .map(|column| render_cell(row.get(column)))
                    .collect();
                writer.write_record(&record).map_err(csv_error)?;
            }
            writer.flush().map_err(|source| TableError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }

        info!(path = %path.display(), rows = self.rows.len(), "saved CSV");
        Ok(())
    }

    fn read_header(path: &Path) -> Result<Vec<String>, TableError> {
        let mut reader = csv::Reader::from_path(path).map_err(|source| TableError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(reader
            .headers()
            .map_err(|source| TableError::Csv {
                path: path.to_path_buf(),
                source,
            })?
            .iter()
            .map(ToString::to_string)
            .collect())
    }
}

/// Renders one cell for CSV output.
///
/// Strings are written as-is; lists and objects as compact JSON; missing and
/// null cells as empty strings.
fn render_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_from_rows_unions_columns_in_first_seen_order() {
        let table = Table::from_rows(vec![
            row(&[("a", json!(1)), ("b", json!(2))]),
            row(&[("c", json!(3)), ("a", json!(4))]),
        ]);
        assert_eq!(table.columns(), ["a", "b", "c"]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_rename_and_drop_column() {
        let mut table = Table::from_rows(vec![row(&[("id", json!("x")), ("raw", json!(1))])]);
        table.rename_column("id", "item_id");
        table.drop_column("raw");
        assert_eq!(table.columns(), ["item_id"]);
        assert_eq!(table.rows()[0]["item_id"], "x");
        assert!(!table.rows()[0].contains_key("raw"));
    }

    #[test]
    fn test_move_column() {
        let mut table = Table::from_rows(vec![row(&[
            ("a", json!(1)),
            ("b", json!(2)),
            ("c", json!(3)),
        ])]);
        table.move_column("c", 0).unwrap();
        assert_eq!(table.columns(), ["c", "a", "b"]);
        assert!(matches!(
            table.move_column("nope", 0),
            Err(TableError::MissingColumn { .. })
        ));
    }

    #[test]
    fn test_set_column_order_keeps_unlisted_columns() {
        let mut table = Table::from_rows(vec![row(&[
            ("item.title", json!("t")),
            ("item_id", json!("i")),
            ("item.date", json!("d")),
        ])]);
        table.set_column_order(&["item_id".to_string(), "missing".to_string()]);
        assert_eq!(table.columns(), ["item_id", "item.title", "item.date"]);
    }

    #[test]
    fn test_csv_roundtrip_renders_nested_values_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let table = Table::from_rows(vec![row(&[
            ("item_id", json!("https://www.loc.gov/item/1/")),
            ("item.subjects", json!(["maps", "history"])),
            ("count", json!(3)),
        ])]);
        table.write_csv(&path, false).unwrap();

        let loaded = Table::from_csv_path(&path).unwrap();
        assert_eq!(loaded.columns(), ["item_id", "item.subjects", "count"]);
        assert_eq!(loaded.rows()[0]["item_id"], "https://www.loc.gov/item/1/");
        assert_eq!(loaded.rows()[0]["item.subjects"], r#"["maps","history"]"#);
        assert_eq!(loaded.rows()[0]["count"], "3");
    }

    #[test]
    fn test_csv_append_follows_existing_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        Table::from_rows(vec![row(&[("a", json!("1")), ("b", json!("2"))])])
            .write_csv(&path, false)
            .unwrap();
        // appended table has the columns in a different order
        Table::from_rows(vec![row(&[("b", json!("4")), ("a", json!("3"))])])
            .write_csv(&path, true)
            .unwrap();

        let loaded = Table::from_csv_path(&path).unwrap();
        assert_eq!(loaded.columns(), ["a", "b"]);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.rows()[1]["a"], "3");
        assert_eq!(loaded.rows()[1]["b"], "4");
    }

    #[test]
    fn test_missing_cells_render_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let table = Table::from_rows(vec![
            row(&[("a", json!("x"))]),
            row(&[("b", json!("y"))]),
        ]);
        table.write_csv(&path, false).unwrap();

        let loaded = Table::from_csv_path(&path).unwrap();
        assert!(!loaded.rows()[0].contains_key("b"));
        assert_eq!(loaded.rows()[1]["b"], "y");
    }

    #[test]
    fn test_add_column_with_computes_per_row() {
        let mut table = Table::from_rows(vec![
            row(&[("files", json!([1, 2, 3]))]),
            row(&[("files", json!([]))]),
        ]);
        table.add_column_with("count", |r| {
            json!(r.get("files").and_then(Value::as_array).map_or(0, Vec::len))
        });
        assert_eq!(table.columns(), ["files", "count"]);
        assert_eq!(table.rows()[0]["count"], 3);
        assert_eq!(table.rows()[1]["count"], 0);
    }

    #[test]
    fn test_map_column_rewrites_present_values_only() {
        let mut table = Table::from_rows(vec![
            row(&[("id", json!("http://loc.gov/item/1/"))]),
            row(&[("other", json!("x"))]),
        ]);
        table.map_column("id", |v| {
            json!(v.as_str().map(|s| s.replace("http://", "https://www.")))
        });
        assert_eq!(table.rows()[0]["id"], "https://www.loc.gov/item/1/");
        assert!(!table.rows()[1].contains_key("id"));
    }

    #[test]
    fn test_filter_preserves_columns() {
        let table = Table::from_rows(vec![
            row(&[("id", json!("keep"))]),
            row(&[("id", json!("drop"))]),
        ]);
        let filtered = table.filter(|r| r.get("id").and_then(Value::as_str) == Some("keep"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.columns(), ["id"]);
    }
}
