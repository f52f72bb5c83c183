//! Store access boundary: schema bootstrap, key ledger reads, batch merges.
//!
//! `PgStore` merges through a staging table and `INSERT .. ON CONFLICT`;
//! `MemoryStore` upserts natively and backs dry runs and tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use vpic_core::{CanonicalTable, CellValue, Column, ColumnType, TableDefinition};

use crate::schema::render_create_table;

/// Postgres caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to store: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("{operation} failed: {source}")]
    Query {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("table {0} does not exist")]
    UnknownTable(String),
    #[error("table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },
    #[error("key columns {key_columns:?} do not match the primary key of {table}")]
    NoMatchingConstraint {
        table: String,
        key_columns: Vec<String>,
    },
    #[error("key {key} appears more than once in the batch for {table}")]
    DuplicateKeyInBatch { table: String, key: String },
    #[error("null value in column {column} of {table} violates not-null constraint")]
    NotNullViolation { table: String, column: String },
}

fn query_failed(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Query { operation, source }
}

/// One merge request: every row of `table` goes through `staging_table` into
/// `target_table`, matched on `key_columns`.
#[derive(Debug, Clone, Copy)]
pub struct MergeBatch<'a> {
    pub target_table: &'a str,
    pub staging_table: &'a str,
    pub key_columns: &'a [String],
    pub table: &'a CanonicalTable,
}

impl MergeBatch<'_> {
    pub fn non_key_columns(&self) -> Vec<&Column> {
        self.table
            .columns()
            .iter()
            .filter(|c| !self.key_columns.contains(&c.name))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeResult {
    pub inserted: u64,
    pub updated: u64,
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Create missing tables; existing tables are left untouched.
    async fn ensure_schema(&self, tables: &[TableDefinition]) -> Result<(), StoreError>;

    /// Distinct values of `column` in `table`. A missing table or column
    /// yields an empty list.
    async fn loaded_keys(&self, table: &str, column: &str) -> Result<Vec<CellValue>, StoreError>;

    /// Insert-or-update every row of the batch atomically. Never deletes.
    async fn merge_batch(&self, batch: MergeBatch<'_>) -> Result<MergeResult, StoreError>;
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes `schema.table` part by part.
pub fn quote_table(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

fn column_list<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.map(quote_ident).collect::<Vec<_>>().join(", ")
}

pub fn render_staging_create(staging_table: &str, columns: &[Column]) -> String {
    let body = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({body})", quote_table(staging_table))
}

/// Single set-based merge from staging into target. Each returned row says
/// whether it was inserted (`xmax = 0`) or updated.
pub fn render_upsert(batch: &MergeBatch<'_>) -> String {
    let cols = column_list(batch.table.columns().iter().map(|c| c.name.as_str()));
    let keys = column_list(batch.key_columns.iter().map(String::as_str));
    let updates = batch
        .non_key_columns()
        .iter()
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(&c.name)))
        .collect::<Vec<_>>();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {} ({cols}) SELECT {cols} FROM {} ON CONFLICT ({keys}) {action} RETURNING (xmax = 0) AS inserted",
        quote_table(batch.target_table),
        quote_table(batch.staging_table),
    )
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[instrument(skip_all, err)]
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map(|pool| Self { pool })
            .map_err(StoreError::Connect)
    }
}

#[async_trait]
impl TargetStore for PgStore {
    #[instrument(skip_all, err)]
    async fn ensure_schema(&self, tables: &[TableDefinition]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_failed("begin ddl"))?;
        for table in tables {
            sqlx::query(&render_create_table(table))
                .execute(&mut *tx)
                .await
                .map_err(query_failed("create table"))?;
        }
        tx.commit().await.map_err(query_failed("commit ddl"))?;
        Ok(())
    }

    async fn loaded_keys(&self, table: &str, column: &str) -> Result<Vec<CellValue>, StoreError> {
        let (schema, bare_table) = match table.rsplit_once('.') {
            Some((schema, bare)) => (Some(schema), bare),
            None => (None, table),
        };
        let present = sqlx::query(
            "SELECT 1 FROM information_schema.columns \
             WHERE table_schema = COALESCE($1, current_schema()) \
               AND table_name = $2 AND column_name = $3",
        )
        .bind(schema)
        .bind(bare_table)
        .bind(column)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("inspect key column"))?;
        if present.is_none() {
            debug!(table, column, "ledger column absent; treating as empty");
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT DISTINCT {col}::text AS key FROM {} WHERE {col} IS NOT NULL",
            quote_table(table),
            col = quote_ident(column),
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed("read key column"))?;
        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("key")
                    .map(|v| CellValue::parse_as(ColumnType::Integer, &v))
                    .map_err(query_failed("decode key"))
            })
            .collect()
    }

    #[instrument(
        skip_all,
        fields(table = batch.target_table, staging = batch.staging_table, rows = batch.table.len()),
        err
    )]
    async fn merge_batch(&self, batch: MergeBatch<'_>) -> Result<MergeResult, StoreError> {
        let columns = batch.table.columns();
        let staging = quote_table(batch.staging_table);
        let mut tx = self.pool.begin().await.map_err(query_failed("begin merge"))?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {staging}"))
            .execute(&mut *tx)
            .await
            .map_err(query_failed("drop staging"))?;
        sqlx::query(&render_staging_create(batch.staging_table, columns))
            .execute(&mut *tx)
            .await
            .map_err(query_failed("create staging"))?;

        let insert_head = format!(
            "INSERT INTO {staging} ({}) ",
            column_list(columns.iter().map(|c| c.name.as_str()))
        );
        let rows_per_statement = (MAX_BIND_PARAMS / columns.len().max(1)).max(1);
        for chunk in batch.table.rows().chunks(rows_per_statement) {
            let mut qb = QueryBuilder::<Postgres>::new(insert_head.as_str());
            qb.push_values(chunk, |mut b, row| {
                for (cell, column) in row.iter().zip(columns) {
                    match (cell.clone(), column.column_type) {
                        (CellValue::Null, ColumnType::Integer) => b.push_bind(None::<i64>),
                        (CellValue::Null, ColumnType::Float) => b.push_bind(None::<f64>),
                        (CellValue::Null, ColumnType::Boolean) => b.push_bind(None::<bool>),
                        (CellValue::Null, ColumnType::Timestamp) => {
                            b.push_bind(None::<chrono::DateTime<chrono::Utc>>)
                        }
                        (CellValue::Null, ColumnType::Text) => b.push_bind(None::<String>),
                        (CellValue::Bool(v), _) => b.push_bind(v),
                        (CellValue::Integer(v), _) => b.push_bind(v),
                        (CellValue::Float(v), _) => b.push_bind(v),
                        (CellValue::Text(v), _) => b.push_bind(v),
                        (CellValue::Timestamp(v), _) => b.push_bind(v),
                    };
                }
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(query_failed("fill staging"))?;
        }

        let merged = sqlx::query(&render_upsert(&batch))
            .fetch_all(&mut *tx)
            .await
            .map_err(query_failed("upsert from staging"))?;
        let mut result = MergeResult::default();
        for row in &merged {
            if row
                .try_get::<bool, _>("inserted")
                .map_err(query_failed("decode upsert result"))?
            {
                result.inserted += 1;
            } else {
                result.updated += 1;
            }
        }

        sqlx::query(&format!("DROP TABLE {staging}"))
            .execute(&mut *tx)
            .await
            .map_err(query_failed("drop staging"))?;
        tx.commit().await.map_err(query_failed("commit merge"))?;
        info!(
            inserted = result.inserted,
            updated = result.updated,
            "merged staging into target"
        );
        Ok(result)
    }
}

#[derive(Debug, Clone)]
struct MemoryTable {
    definition: TableDefinition,
    rows: Vec<Vec<CellValue>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    merge_calls: usize,
}

/// In-process store with the same merge contract as `PgStore`. A merge
/// works on a copy of the target and swaps it in only on success.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of `table` in insertion order; `None` when the table is missing.
    pub async fn rows(&self, table: &str) -> Option<Vec<Vec<CellValue>>> {
        let state = self.state.lock().await;
        state.tables.get(table).map(|t| t.rows.clone())
    }

    pub async fn definition(&self, table: &str) -> Option<TableDefinition> {
        let state = self.state.lock().await;
        state.tables.get(table).map(|t| t.definition.clone())
    }

    /// Number of merges that reached the store (committed or not).
    pub async fn merge_calls(&self) -> usize {
        self.state.lock().await.merge_calls
    }
}

fn merge_into(
    target: &MemoryTable,
    batch: &MergeBatch<'_>,
) -> Result<(Vec<Vec<CellValue>>, MergeResult), StoreError> {
    let def = &target.definition;
    let position = |name: &str| def.columns.iter().position(|c| c.name == name);

    let mut batch_targets = Vec::with_capacity(batch.table.columns().len());
    for column in batch.table.columns() {
        let idx = position(column.name.as_str()).ok_or_else(|| StoreError::UnknownColumn {
            table: def.name.clone(),
            column: column.name.clone(),
        })?;
        batch_targets.push(idx);
    }

    let requested = batch.key_columns.iter().collect::<HashSet<_>>();
    let primary = def.primary_key.iter().collect::<HashSet<_>>();
    if requested != primary {
        return Err(StoreError::NoMatchingConstraint {
            table: def.name.clone(),
            key_columns: batch.key_columns.to_vec(),
        });
    }
    let target_key_indices = def
        .primary_key
        .iter()
        .filter_map(|k| position(k.as_str()))
        .collect::<Vec<_>>();
    let batch_key_indices = def
        .primary_key
        .iter()
        .filter_map(|k| batch.table.column_index(k))
        .collect::<Vec<_>>();
    let updates_anything = !batch.non_key_columns().is_empty();

    let mut rows = target.rows.clone();
    let mut index = rows
        .iter()
        .enumerate()
        .map(|(i, row)| (CanonicalTable::key_of(row, &target_key_indices), i))
        .collect::<HashMap<_, _>>();
    let mut touched = HashSet::new();
    let mut result = MergeResult::default();

    for incoming in batch.table.rows() {
        let key = CanonicalTable::key_of(incoming, &batch_key_indices);
        if !touched.insert(key.clone()) {
            if updates_anything {
                return Err(StoreError::DuplicateKeyInBatch {
                    table: def.name.clone(),
                    key,
                });
            }
            continue;
        }
        match index.get(&key) {
            Some(&existing) => {
                if !updates_anything {
                    continue;
                }
                for (batch_idx, (cell, &target_idx)) in
                    incoming.iter().zip(&batch_targets).enumerate()
                {
                    if !batch_key_indices.contains(&batch_idx) {
                        rows[existing][target_idx] = cell.clone();
                    }
                }
                result.updated += 1;
            }
            None => {
                let mut row = vec![CellValue::Null; def.columns.len()];
                for (cell, &target_idx) in incoming.iter().zip(&batch_targets) {
                    row[target_idx] = cell.clone();
                }
                index.insert(key, rows.len());
                rows.push(row);
                result.inserted += 1;
            }
        }
    }

    for row in &rows {
        for (cell, column) in row.iter().zip(&def.columns) {
            if cell.is_null() && !column.nullable {
                return Err(StoreError::NotNullViolation {
                    table: def.name.clone(),
                    column: column.name.clone(),
                });
            }
        }
    }
    Ok((rows, result))
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn ensure_schema(&self, tables: &[TableDefinition]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for def in tables {
            state
                .tables
                .entry(def.name.clone())
                .or_insert_with(|| MemoryTable {
                    definition: def.clone(),
                    rows: Vec::new(),
                });
        }
        Ok(())
    }

    async fn loaded_keys(&self, table: &str, column: &str) -> Result<Vec<CellValue>, StoreError> {
        let state = self.state.lock().await;
        let Some(target) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        let Some(idx) = target.definition.columns.iter().position(|c| c.name == column) else {
            return Ok(Vec::new());
        };
        let mut seen = HashSet::new();
        Ok(target
            .rows
            .iter()
            .map(|row| &row[idx])
            .filter(|cell| !cell.is_null() && seen.insert(cell.key_fragment()))
            .cloned()
            .collect())
    }

    async fn merge_batch(&self, batch: MergeBatch<'_>) -> Result<MergeResult, StoreError> {
        let mut state = self.state.lock().await;
        state.merge_calls += 1;
        let target = state
            .tables
            .get(batch.target_table)
            .ok_or_else(|| StoreError::UnknownTable(batch.target_table.to_string()))?;
        let (rows, result) = merge_into(target, &batch)?;
        if let Some(target) = state.tables.get_mut(batch.target_table) {
            target.rows = rows;
        }
        debug!(
            table = batch.target_table,
            inserted = result.inserted,
            updated = result.updated,
            "merged batch in memory"
        );
        Ok(result)
    }
}
