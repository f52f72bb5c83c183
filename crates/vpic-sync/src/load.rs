//! Staged, idempotent upsert of a canonical table into a target table.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument};
use vpic_core::CanonicalTable;

use crate::store::{MergeBatch, MergeResult, StoreError, TargetStore};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no key columns given for {table}")]
    NoKeyColumns { table: String },
    #[error("key columns {missing:?} not found in {table} (columns: {columns:?})")]
    MissingKeyColumns {
        table: String,
        missing: Vec<String>,
        columns: Vec<String>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn default_staging_table(target: &str) -> String {
    format!("stg_{}", target.replace('.', "_"))
}

#[derive(Clone)]
pub struct StagingUpsertLoader {
    store: Arc<dyn TargetStore>,
}

impl StagingUpsertLoader {
    pub fn new(store: Arc<dyn TargetStore>) -> Self {
        Self { store }
    }

    /// Upserts every row of `table` into `target`, matched on `key_columns`.
    ///
    /// An empty table is a no-op that never touches the store. Rows of the
    /// target absent from `table` are left alone.
    #[instrument(skip_all, fields(table = target, rows = table.len()))]
    pub async fn load(
        &self,
        table: &CanonicalTable,
        target: &str,
        key_columns: &[String],
        staging: Option<&str>,
    ) -> Result<MergeResult, LoadError> {
        if table.is_empty() {
            info!(table = target, "no rows to load; skipping");
            return Ok(MergeResult::default());
        }
        if key_columns.is_empty() {
            return Err(LoadError::NoKeyColumns {
                table: target.to_string(),
            });
        }
        let missing = key_columns
            .iter()
            .filter(|k| !table.has_column(k))
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(LoadError::MissingKeyColumns {
                table: target.to_string(),
                missing,
                columns: table.column_names().into_iter().map(str::to_string).collect(),
            });
        }

        let staging = staging
            .map(str::to_string)
            .unwrap_or_else(|| default_staging_table(target));
        let result = self
            .store
            .merge_batch(MergeBatch {
                target_table: target,
                staging_table: &staging,
                key_columns,
                table,
            })
            .await?;
        info!(
            table = target,
            inserted = result.inserted,
            updated = result.updated,
            "loaded rows"
        );
        Ok(result)
    }
}
