//! Raw records -> canonical table: project, dedupe, sort, validate, stamp.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use vpic_core::{
    parse_timestamp, CanonicalTable, CellValue, ColumnRule, RawRecord, TableSchema,
    LOAD_TIMESTAMP_COLUMN,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("no {table} records to normalize")]
    NoData { table: &'static str },
    #[error("{table} input is missing expected columns {missing:?}")]
    MissingColumns {
        table: &'static str,
        missing: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    NotPositiveInteger,
    BlankText,
}

/// Row-level data-quality finding. The row stays in the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationWarning {
    pub table: &'static str,
    /// Position of the row in the normalized output.
    pub row: usize,
    pub column: &'static str,
    pub violation: Violation,
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub table: CanonicalTable,
    pub diagnostics: Vec<ValidationWarning>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    stamped_at: Option<DateTime<Utc>>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizer whose load timestamp is fixed instead of read from the clock.
    pub fn at(stamped_at: DateTime<Utc>) -> Self {
        Self {
            stamped_at: Some(stamped_at),
        }
    }

    pub fn normalize(
        &self,
        schema: &TableSchema,
        raw: &[RawRecord],
    ) -> Result<Normalized, NormalizeError> {
        if raw.is_empty() {
            return Err(NormalizeError::NoData { table: schema.name });
        }

        let missing = schema
            .columns
            .iter()
            .filter(|c| !raw.iter().any(|r| r.contains(c.name)))
            .map(|c| c.name.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(NormalizeError::MissingColumns {
                table: schema.name,
                missing,
            });
        }

        let key_indices = schema
            .key_columns
            .iter()
            .filter_map(|k| schema.columns.iter().position(|c| c.name == *k))
            .collect::<Vec<_>>();
        let mut seen = HashSet::new();
        let mut rows = Vec::with_capacity(raw.len());
        for record in raw {
            let row = schema
                .columns
                .iter()
                .map(|c| record.get(c.name).cloned().unwrap_or_default())
                .collect::<Vec<_>>();
            if seen.insert(CanonicalTable::key_of(&row, &key_indices)) {
                rows.push((row, record.get(LOAD_TIMESTAMP_COLUMN)));
            }
        }

        let sort_indices = schema
            .sort_columns
            .iter()
            .filter_map(|s| schema.columns.iter().position(|c| c.name == *s))
            .collect::<Vec<_>>();
        rows.sort_by(|(a, _), (b, _)| {
            sort_indices
                .iter()
                .map(|&i| a[i].sort_cmp(&b[i]))
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let stamped_at = self.stamped_at.unwrap_or_else(Utc::now);
        let mut table = CanonicalTable::new(schema.canonical_columns());
        for (mut row, carried) in rows {
            if schema.stamp_load_timestamp {
                row.push(CellValue::Timestamp(
                    carried_timestamp(carried).unwrap_or(stamped_at),
                ));
            }
            table.push_row(row);
        }

        let diagnostics = validate(schema, &table);
        Ok(Normalized { table, diagnostics })
    }
}

fn carried_timestamp(cell: Option<&CellValue>) -> Option<DateTime<Utc>> {
    match cell? {
        CellValue::Timestamp(ts) => Some(*ts),
        CellValue::Text(text) => parse_timestamp(text),
        _ => None,
    }
}

fn violates(rule: ColumnRule, cell: &CellValue) -> Option<Violation> {
    match rule {
        ColumnRule::Any => None,
        ColumnRule::PositiveInteger => match cell {
            CellValue::Integer(v) if *v > 0 => None,
            _ => Some(Violation::NotPositiveInteger),
        },
        ColumnRule::NonBlankText => match cell {
            CellValue::Text(v) if !v.trim().is_empty() => None,
            _ => Some(Violation::BlankText),
        },
    }
}

fn validate(schema: &TableSchema, table: &CanonicalTable) -> Vec<ValidationWarning> {
    let mut diagnostics = Vec::new();
    for (col_idx, column_spec) in schema.columns.iter().enumerate() {
        for (row_idx, row) in table.rows().iter().enumerate() {
            if let Some(violation) = violates(column_spec.rule, &row[col_idx]) {
                warn!(
                    table = schema.name,
                    row = row_idx,
                    column = column_spec.name,
                    value = %row[col_idx],
                    ?violation,
                    "incorrect {} detected at index {row_idx}",
                    column_spec.name
                );
                diagnostics.push(ValidationWarning {
                    table: schema.name,
                    row: row_idx,
                    column: column_spec.name,
                    violation,
                });
            }
        }
    }
    diagnostics
}
