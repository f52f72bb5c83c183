//! Delimited-text interchange for canonical tables.
//!
//! Files carry a header row with the declared column names, exactly as
//! declared. Timestamps are written as RFC 3339 and nulls as empty fields.
//! Empty text shares that encoding and reads back as null.

use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;
use tokio::fs;
use tracing::info;
use vpic_core::{CanonicalTable, CellValue, Column, ColumnType, RawRecord, TableSchema};

use crate::{sha256_hex, write_atomic, FileError, FileReport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeFileReport {
    pub file: FileReport,
    pub added: usize,
    pub total: usize,
}

fn encode_table(path: &Path, table: &CanonicalTable) -> Result<Vec<u8>, FileError> {
    let csv_err = |source| FileError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(table.column_names()).map_err(csv_err)?;
    for row in table.rows() {
        writer
            .write_record(row.iter().map(CellValue::render))
            .map_err(csv_err)?;
    }
    writer.into_inner().map_err(|e| FileError::Encode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

pub async fn write_table(path: &Path, table: &CanonicalTable) -> Result<FileReport, FileError> {
    let bytes = encode_table(path, table)?;
    write_atomic(path, &bytes).await?;
    info!(path = %path.display(), rows = table.len(), "wrote table file");
    Ok(FileReport {
        path: path.to_path_buf(),
        rows: table.len(),
        bytes: bytes.len() as u64,
        sha256: sha256_hex(&bytes),
    })
}

struct RawFile {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

async fn read_raw(path: &Path) -> Result<Option<RawFile>, FileError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(FileError::io(path, err)),
    };
    let csv_err = |source| FileError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes.as_slice());
    let headers = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(Some(RawFile { headers, rows }))
}

/// Reads a table file back as raw records, typing fields by the schema's
/// declared column types. Columns the schema does not know stay text.
pub async fn read_table(path: &Path, schema: &TableSchema) -> Result<Vec<RawRecord>, FileError> {
    let raw = read_raw(path)
        .await?
        .ok_or_else(|| FileError::NotFound(path.to_path_buf()))?;
    let types = raw
        .headers
        .iter()
        .map(|h| schema.column_type(h).unwrap_or(ColumnType::Text))
        .collect::<Vec<_>>();
    let records = raw
        .rows
        .iter()
        .map(|row| {
            raw.headers
                .iter()
                .zip(&types)
                .enumerate()
                .fold(RawRecord::new(), |record, (i, (name, ty))| {
                    let field = row.get(i).map(String::as_str).unwrap_or("");
                    record.with(name.clone(), CellValue::parse_as(*ty, field))
                })
        })
        .collect();
    Ok(records)
}

fn infer_column_type(values: impl Iterator<Item = String>) -> ColumnType {
    let mut present = values.filter(|v| !v.is_empty()).peekable();
    if present.peek().is_none() {
        return ColumnType::Text;
    }
    let present = present.collect::<Vec<_>>();
    let parses_as = |candidate: ColumnType| {
        present.iter().all(|v| {
            matches!(
                (candidate, CellValue::parse_as(candidate, v)),
                (ColumnType::Integer, CellValue::Integer(_))
                    | (ColumnType::Float, CellValue::Float(_))
                    | (ColumnType::Timestamp, CellValue::Timestamp(_))
            )
        })
    };
    [ColumnType::Integer, ColumnType::Float, ColumnType::Timestamp]
        .into_iter()
        .find(|candidate| parses_as(*candidate))
        .unwrap_or(ColumnType::Text)
}

/// Reads an arbitrary delimited file, inferring each column's type from its
/// values (integer, then float, then timestamp, else text).
pub async fn read_csv(path: &Path) -> Result<CanonicalTable, FileError> {
    let raw = read_raw(path)
        .await?
        .ok_or_else(|| FileError::NotFound(path.to_path_buf()))?;
    let columns = raw
        .headers
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let values = raw
                .rows
                .iter()
                .map(move |r| r.get(i).cloned().unwrap_or_default());
            Column::new(name.clone(), infer_column_type(values))
        })
        .collect::<Vec<_>>();
    let mut table = CanonicalTable::new(columns.clone());
    for row in &raw.rows {
        table.push_row(
            columns
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    CellValue::parse_as(c.column_type, row.get(i).map(String::as_str).unwrap_or(""))
                })
                .collect(),
        );
    }
    info!(
        path = %path.display(),
        rows = table.len(),
        columns = table.columns().len(),
        "extracted table from file"
    );
    Ok(table)
}

/// Key ledger read from a table file. A missing file or a missing column
/// both mean nothing has been collected yet.
pub async fn read_key_column(
    path: &Path,
    column: &str,
    column_type: ColumnType,
) -> Result<Vec<CellValue>, FileError> {
    let Some(raw) = read_raw(path).await? else {
        return Ok(Vec::new());
    };
    let Some(idx) = raw.headers.iter().position(|h| h == column) else {
        return Ok(Vec::new());
    };
    Ok(raw
        .rows
        .iter()
        .map(|r| CellValue::parse_as(column_type, r.get(idx).map(String::as_str).unwrap_or("")))
        .collect())
}

/// Appends `new_rows` to the table file at `path`, keeping the first
/// occurrence of every key (rows already on file win).
pub async fn merge_table_file(
    path: &Path,
    new_rows: &CanonicalTable,
    key_columns: &[&str],
) -> Result<MergeFileReport, FileError> {
    let mut columns = Vec::new();
    let mut combined_rows: Vec<Vec<CellValue>> = Vec::new();

    if let Some(existing) = read_raw(path).await? {
        for name in &existing.headers {
            let column_type = new_rows
                .columns()
                .iter()
                .find(|c| &c.name == name)
                .map(|c| c.column_type)
                .unwrap_or(ColumnType::Text);
            columns.push(Column::new(name.clone(), column_type));
        }
        for row in &existing.rows {
            combined_rows.push(
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| {
                        CellValue::parse_as(
                            c.column_type,
                            row.get(i).map(String::as_str).unwrap_or(""),
                        )
                    })
                    .collect(),
            );
        }
    }
    let existing_rows = combined_rows.len();
    for column in new_rows.columns() {
        if !columns.iter().any(|c: &Column| c.name == column.name) {
            columns.push(column.clone());
        }
    }

    let names = columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
    let mut combined = CanonicalTable::new(columns);
    for row in combined_rows {
        combined.push_row(row);
    }
    for row in new_rows.rows() {
        combined.push_row(
            names
                .iter()
                .map(|name| {
                    new_rows
                        .column_index(name)
                        .map(|i| row[i].clone())
                        .unwrap_or_default()
                })
                .collect(),
        );
    }

    let key_indices = key_columns
        .iter()
        .filter_map(|k| combined.column_index(k))
        .collect::<Vec<_>>();
    let mut seen = HashSet::new();
    let columns = combined.columns().to_vec();
    let deduped = combined
        .into_rows()
        .into_iter()
        .filter(|row| seen.insert(CanonicalTable::key_of(row, &key_indices)))
        .collect::<Vec<_>>();
    let combined = CanonicalTable::from_rows(columns, deduped);

    let total = combined.len();
    let file = write_table(path, &combined).await?;
    let added = total.saturating_sub(existing_rows);
    info!(
        path = %path.display(),
        offered = new_rows.len(),
        added,
        total,
        "merged rows into table file"
    );
    Ok(MergeFileReport { file, added, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vpic_core::MAKES;

    fn makes_table(rows: &[(i64, &str)]) -> CanonicalTable {
        CanonicalTable::from_rows(
            vec![
                Column::new("Make_ID", ColumnType::Integer),
                Column::new("Make_Name", ColumnType::Text),
            ],
            rows.iter()
                .map(|(id, name)| vec![CellValue::Integer(*id), CellValue::text(*name)])
                .collect(),
        )
    }

    #[tokio::test]
    async fn header_row_matches_declared_names() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("makes.csv");
        write_table(&path, &makes_table(&[(1, "ACURA")]))
            .await
            .expect("write");
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().next(), Some("Make_ID,Make_Name"));
    }

    #[tokio::test]
    async fn read_table_types_fields_by_schema() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("makes.csv");
        std::fs::write(
            &path,
            "Make_ID,Make_Name,load_timestamp\n7,\"TESLA, INC.\",2026-02-24T12:00:00+00:00\nx,,\n",
        )
        .unwrap();
        let records = read_table(&path, &MAKES).await.expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("Make_ID"), Some(&CellValue::Integer(7)));
        assert_eq!(records[0].get("Make_Name"), Some(&CellValue::text("TESLA, INC.")));
        assert!(matches!(
            records[0].get("load_timestamp"),
            Some(CellValue::Timestamp(_))
        ));
        assert_eq!(records[1].get("Make_ID"), Some(&CellValue::text("x")));
        assert_eq!(records[1].get("Make_Name"), Some(&CellValue::Null));
    }

    #[tokio::test]
    async fn missing_file_is_an_error_for_reads() {
        let dir = tempdir().expect("tempdir");
        let err = read_csv(&dir.path().join("absent.csv")).await.unwrap_err();
        assert!(matches!(err, FileError::NotFound(_)));
    }

    #[tokio::test]
    async fn read_csv_infers_column_types() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("models.csv");
        std::fs::write(&path, "Model_ID,Model_Name,Score\n1,Civic,1.5\n2,,2\n").unwrap();
        let table = read_csv(&path).await.expect("read");
        let types = table.columns().iter().map(|c| c.column_type).collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![ColumnType::Integer, ColumnType::Text, ColumnType::Float]
        );
        assert_eq!(table.cell(1, "Model_Name"), Some(&CellValue::Null));
    }

    #[tokio::test]
    async fn key_ledger_tolerates_missing_file_and_column() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("models.csv");
        let keys = read_key_column(&path, "Make_ID", ColumnType::Integer)
            .await
            .expect("missing file");
        assert!(keys.is_empty());

        std::fs::write(&path, "Model_ID\n1\n").unwrap();
        let keys = read_key_column(&path, "Make_ID", ColumnType::Integer)
            .await
            .expect("missing column");
        assert!(keys.is_empty());

        std::fs::write(&path, "Make_ID,Model_ID\n5,1\n5,2\n9,3\n").unwrap();
        let keys = read_key_column(&path, "Make_ID", ColumnType::Integer)
            .await
            .expect("present");
        assert_eq!(
            keys,
            vec![CellValue::Integer(5), CellValue::Integer(5), CellValue::Integer(9)]
        );
    }

    #[tokio::test]
    async fn incremental_merge_keeps_rows_already_on_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("makes.csv");
        let first = merge_table_file(&path, &makes_table(&[(1, "ACURA"), (2, "BMW")]), &["Make_ID"])
            .await
            .expect("first merge");
        assert_eq!((first.added, first.total), (2, 2));

        let second = merge_table_file(
            &path,
            &makes_table(&[(2, "BMW RENAMED"), (3, "CHEVROLET")]),
            &["Make_ID"],
        )
        .await
        .expect("second merge");
        assert_eq!((second.added, second.total), (1, 3));

        let records = read_table(&path, &MAKES).await.expect("read back");
        let names = records
            .iter()
            .map(|r| r.get("Make_Name").and_then(CellValue::as_str).unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["ACURA", "BMW", "CHEVROLET"]);
    }
}
