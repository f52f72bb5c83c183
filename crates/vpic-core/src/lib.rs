//! Canonical data model for the vPIC catalog harvester.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "vpic-core";

/// Column stamped with the UTC load time of a row.
pub const LOAD_TIMESTAMP_COLUMN: &str = "load_timestamp";

/// Primary key of a make; addresses one unit of dependent fetch work.
pub type WorkKey = i64;

/// Loosely typed scalar as found in upstream payloads and tabular files.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Text form used in delimited files; null renders as an empty field.
    pub fn render(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(v) => v.to_string(),
            Self::Integer(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Text(v) => v.clone(),
            Self::Timestamp(v) => v.to_rfc3339(),
        }
    }

    /// Identity of the value when used as (part of) a key tuple.
    pub fn key_fragment(&self) -> String {
        match self {
            Self::Null => "null:".to_string(),
            Self::Bool(v) => format!("bool:{v}"),
            Self::Integer(v) => format!("num:{v}"),
            Self::Float(v) if v.fract() == 0.0 && v.is_finite() => format!("num:{}", *v as i64),
            Self::Float(v) => format!("num:{v}"),
            Self::Text(v) => format!("text:{v}"),
            Self::Timestamp(v) => format!("ts:{}", v.to_rfc3339()),
        }
    }

    /// Parses a delimited-file field as the declared column type.
    ///
    /// Empty fields become null, so an empty text value written to a file
    /// reads back as null. Integer columns accept non-integral numbers as
    /// floats. Other fields that do not parse are kept as text so validation
    /// can report them instead of the reader failing.
    pub fn parse_as(column_type: ColumnType, raw: &str) -> Self {
        if raw.is_empty() {
            return Self::Null;
        }
        let parsed = match column_type {
            ColumnType::Integer => {
                let trimmed = raw.trim();
                trimmed
                    .parse::<i64>()
                    .ok()
                    .map(Self::Integer)
                    .or_else(|| trimmed.parse::<f64>().ok().map(Self::Float))
            }
            ColumnType::Float => raw.trim().parse::<f64>().ok().map(Self::Float),
            ColumnType::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "true" => Some(Self::Bool(true)),
                "false" => Some(Self::Bool(false)),
                _ => None,
            },
            ColumnType::Timestamp => parse_timestamp(raw).map(Self::Timestamp),
            ColumnType::Text => None,
        };
        parsed.unwrap_or_else(|| Self::Text(raw.to_string()))
    }

    /// Total order used for deterministic sorting: numbers before text before
    /// other kinds, nulls last.
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Integer(a), Self::Float(b)) => (*a as f64).total_cmp(b),
            (Self::Float(a), Self::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Self::Integer(_) | Self::Float(_) => 0,
            Self::Text(_) => 1,
            Self::Timestamp(_) => 2,
            Self::Bool(_) => 3,
            Self::Null => 4,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NaN"),
            other => f.write_str(&other.render()),
        }
    }
}

impl From<&JsonValue> for CellValue {
    fn from(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(v) => Self::Bool(*v),
            JsonValue::Number(n) => match n.as_i64() {
                Some(v) => Self::Integer(v),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            JsonValue::String(v) => Self::Text(v.clone()),
            other => Self::Text(other.to_string()),
        }
    }
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// One upstream object or file row before normalization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawRecord {
    fields: BTreeMap<String, CellValue>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: CellValue) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: CellValue) {
        self.fields.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.fields.get(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.fields.contains_key(column)
    }

    /// Builds a record from a JSON object; non-object values yield `None`.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        let object = value.as_object()?;
        Some(Self {
            fields: object
                .iter()
                .map(|(k, v)| (k.clone(), CellValue::from(v)))
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Text,
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer => "BIGINT",
            Self::Float => "DOUBLE PRECISION",
            Self::Boolean => "BOOLEAN",
            Self::Text => "TEXT",
            Self::Timestamp => "TIMESTAMPTZ",
        }
    }
}

/// Row-level data-quality rule checked by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRule {
    Any,
    PositiveInteger,
    NonBlankText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub rule: ColumnRule,
}

const fn column(name: &'static str, column_type: ColumnType, rule: ColumnRule) -> ColumnSpec {
    ColumnSpec {
        name,
        column_type,
        rule,
    }
}

/// Static declaration of a canonical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    /// Expected upstream columns, in output order.
    pub columns: &'static [ColumnSpec],
    pub key_columns: &'static [&'static str],
    pub sort_columns: &'static [&'static str],
    pub stamp_load_timestamp: bool,
    pub store_table: &'static str,
}

pub const MAKES: TableSchema = TableSchema {
    name: "makes",
    columns: &[
        column("Make_ID", ColumnType::Integer, ColumnRule::PositiveInteger),
        column("Make_Name", ColumnType::Text, ColumnRule::NonBlankText),
    ],
    key_columns: &["Make_ID"],
    sort_columns: &["Make_Name"],
    stamp_load_timestamp: true,
    store_table: "makes",
};

pub const MODELS: TableSchema = TableSchema {
    name: "models",
    columns: &[
        column("Make_ID", ColumnType::Integer, ColumnRule::Any),
        column("Make_Name", ColumnType::Text, ColumnRule::Any),
        column("Model_ID", ColumnType::Integer, ColumnRule::PositiveInteger),
        column("Model_Name", ColumnType::Text, ColumnRule::NonBlankText),
    ],
    key_columns: &["Model_ID"],
    sort_columns: &["Make_Name", "Model_Name"],
    stamp_load_timestamp: false,
    store_table: "models",
};

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column layout of the normalized table, including the stamped load time.
    pub fn canonical_columns(&self) -> Vec<Column> {
        let mut columns = self
            .columns
            .iter()
            .map(|c| Column::new(c.name, c.column_type))
            .collect::<Vec<_>>();
        if self.stamp_load_timestamp {
            columns.push(Column::new(LOAD_TIMESTAMP_COLUMN, ColumnType::Timestamp));
        }
        columns
    }

    /// Declared type of a column in the canonical layout.
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        if name == LOAD_TIMESTAMP_COLUMN {
            return Some(ColumnType::Timestamp);
        }
        self.column(name).map(|c| c.column_type)
    }

    /// Key columns as named in the store layout.
    pub fn store_key_columns(&self) -> Vec<String> {
        self.key_columns.iter().map(|c| store_column_name(c)).collect()
    }

    /// Store layout: lowercase names, a load timestamp, the declared primary key.
    pub fn store_definition(&self) -> TableDefinition {
        let mut columns = self
            .columns
            .iter()
            .map(|c| ColumnDefinition {
                name: store_column_name(c.name),
                column_type: c.column_type,
                nullable: !self.key_columns.contains(&c.name),
            })
            .collect::<Vec<_>>();
        columns.push(ColumnDefinition {
            name: LOAD_TIMESTAMP_COLUMN.to_string(),
            column_type: ColumnType::Timestamp,
            nullable: false,
        });
        TableDefinition {
            name: self.store_table.to_string(),
            columns,
            primary_key: self.store_key_columns(),
        }
    }
}

pub fn store_column_name(name: &str) -> String {
    name.to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Rows conforming to a fixed, named column layout.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CanonicalTable {
    columns: Vec<Column>,
    rows: Vec<Vec<CellValue>>,
}

impl CanonicalTable {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Builds a table from rows, fitting each row to the column count the way
    /// [`CanonicalTable::push_row`] does.
    pub fn from_rows(columns: Vec<Column>, rows: Vec<Vec<CellValue>>) -> Self {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row);
        }
        table
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<CellValue>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends a row; short rows are padded with nulls, long rows truncated.
    pub fn push_row(&mut self, mut row: Vec<CellValue>) {
        row.resize(self.columns.len(), CellValue::Null);
        self.rows.push(row);
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&CellValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Values of one column, top to bottom; `None` when the column is absent.
    pub fn column_values(&self, column: &str) -> Option<Vec<&CellValue>> {
        let idx = self.column_index(column)?;
        Some(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// Identity of a row restricted to the given column indices.
    pub fn key_of(row: &[CellValue], key_indices: &[usize]) -> String {
        key_indices
            .iter()
            .map(|&i| row.get(i).map(CellValue::key_fragment).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }

    pub fn rename_columns(&mut self, rename: impl Fn(&str) -> String) {
        for column in &mut self.columns {
            column.name = rename(&column.name);
        }
    }

    /// Adds a column filled with `value` for every row.
    pub fn push_column(&mut self, column: Column, value: CellValue) {
        self.columns.push(column);
        for row in &mut self.rows {
            row.push(value.clone());
        }
    }

    pub fn set_column_type(&mut self, index: usize, column_type: ColumnType) {
        if let Some(column) = self.columns.get_mut(index) {
            column.column_type = column_type;
        }
    }

    pub fn map_column(&mut self, index: usize, f: impl Fn(&CellValue) -> CellValue) {
        for row in &mut self.rows {
            if let Some(cell) = row.get_mut(index) {
                *cell = f(cell);
            }
        }
    }

    /// Fixed-width text rendering of the first `n` rows, for log previews.
    pub fn preview(&self, n: usize) -> String {
        let shown = &self.rows[..self.rows.len().min(n)];
        let mut widths = self
            .columns
            .iter()
            .map(|c| c.name.chars().count())
            .collect::<Vec<_>>();
        let rendered = shown
            .iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        for row in &rendered {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
        let index_width = shown.len().saturating_sub(1).to_string().len();

        let mut lines = Vec::with_capacity(rendered.len() + 1);
        let header = self
            .columns
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:>w$}", c.name, w = *w))
            .collect::<Vec<_>>()
            .join("  ");
        lines.push(format!("{:index_width$}  {header}", ""));
        for (idx, row) in rendered.iter().enumerate() {
            let body = row
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:>w$}", c, w = *w))
                .collect::<Vec<_>>()
                .join("  ");
            lines.push(format!("{idx:<index_width$}  {body}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

/// Store-side table layout used by schema bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub primary_key: Vec<String>,
}

impl TableDefinition {
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_numbers_keep_integer_identity() {
        let record = RawRecord::from_json(&json!({"Make_ID": 440, "Make_Name": "ASTON MARTIN", "Ratio": 1.5}))
            .unwrap();
        assert_eq!(record.get("Make_ID"), Some(&CellValue::Integer(440)));
        assert_eq!(record.get("Make_Name"), Some(&CellValue::text("ASTON MARTIN")));
        assert_eq!(record.get("Ratio"), Some(&CellValue::Float(1.5)));
        assert!(RawRecord::from_json(&json!([1, 2])).is_none());
    }

    #[test]
    fn sort_order_places_nulls_last() {
        let mut cells = vec![
            CellValue::Null,
            CellValue::text("b"),
            CellValue::Integer(3),
            CellValue::text("B"),
        ];
        cells.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(
            cells,
            vec![
                CellValue::Integer(3),
                CellValue::text("B"),
                CellValue::text("b"),
                CellValue::Null
            ]
        );
    }

    #[test]
    fn unparseable_fields_fall_back_to_text() {
        assert_eq!(CellValue::parse_as(ColumnType::Integer, "42"), CellValue::Integer(42));
        assert_eq!(CellValue::parse_as(ColumnType::Integer, "x1"), CellValue::text("x1"));
        assert_eq!(CellValue::parse_as(ColumnType::Integer, "7.5"), CellValue::Float(7.5));
        assert_eq!(CellValue::parse_as(ColumnType::Text, ""), CellValue::Null);
        let ts = CellValue::parse_as(ColumnType::Timestamp, "2026-02-24T12:00:00+00:00");
        assert!(matches!(ts, CellValue::Timestamp(_)));
    }

    #[test]
    fn store_definition_lowercases_and_adds_load_timestamp() {
        let def = MODELS.store_definition();
        let names = def.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["make_id", "make_name", "model_id", "model_name", "load_timestamp"]
        );
        assert_eq!(def.primary_key, vec!["model_id".to_string()]);
        assert!(!def.column("model_id").unwrap().nullable);
        assert!(def.column("make_name").unwrap().nullable);
    }

    #[test]
    fn integer_and_integral_float_share_key_identity() {
        assert_eq!(
            CellValue::Integer(7).key_fragment(),
            CellValue::Float(7.0).key_fragment()
        );
        assert_ne!(
            CellValue::Integer(7).key_fragment(),
            CellValue::text("7").key_fragment()
        );
    }

    #[test]
    fn preview_renders_header_and_rows() {
        let table = CanonicalTable::from_rows(
            vec![
                Column::new("Make_ID", ColumnType::Integer),
                Column::new("Make_Name", ColumnType::Text),
            ],
            vec![vec![CellValue::Integer(1), CellValue::text("ACURA")]],
        );
        let preview = table.preview(10);
        assert!(preview.contains("Make_ID"));
        assert!(preview.contains("ACURA"));
        assert_eq!(preview.lines().count(), 2);
    }

    #[test]
    fn from_rows_fits_ragged_rows_to_the_columns() {
        let table = CanonicalTable::from_rows(
            vec![
                Column::new("Make_ID", ColumnType::Integer),
                Column::new("Make_Name", ColumnType::Text),
            ],
            vec![
                vec![CellValue::Integer(1)],
                vec![
                    CellValue::Integer(2),
                    CellValue::text("BMW"),
                    CellValue::text("extra"),
                ],
            ],
        );
        assert_eq!(
            table.column_values("Make_Name"),
            Some(vec![&CellValue::Null, &CellValue::text("BMW")])
        );
        assert!(table.rows().iter().all(|r| r.len() == 2));
        assert_eq!(table.preview(5).lines().count(), 3);
    }
}
