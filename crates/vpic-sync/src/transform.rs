//! Canonical layout -> store layout.

use chrono::{DateTime, Utc};
use tracing::warn;
use vpic_core::{
    parse_timestamp, store_column_name, CanonicalTable, CellValue, Column, ColumnType,
    LOAD_TIMESTAMP_COLUMN,
};

/// Lowercases column names and guarantees a typed `load_timestamp` column.
///
/// A carried load time is kept when it parses; anything else gets `now`.
pub fn to_store_layout(table: &CanonicalTable, now: DateTime<Utc>) -> CanonicalTable {
    let mut out = table.clone();
    out.rename_columns(store_column_name);
    match out.column_index(LOAD_TIMESTAMP_COLUMN) {
        Some(idx) => {
            out.set_column_type(idx, ColumnType::Timestamp);
            out.map_column(idx, |cell| match cell {
                CellValue::Timestamp(ts) => CellValue::Timestamp(*ts),
                CellValue::Text(text) => match parse_timestamp(text) {
                    Some(ts) => CellValue::Timestamp(ts),
                    None => {
                        warn!(value = %text, "unparseable load_timestamp; stamping now");
                        CellValue::Timestamp(now)
                    }
                },
                _ => CellValue::Timestamp(now),
            });
        }
        None => out.push_column(
            Column::new(LOAD_TIMESTAMP_COLUMN, ColumnType::Timestamp),
            CellValue::Timestamp(now),
        ),
    }
    out
}
