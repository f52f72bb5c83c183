//! Idempotent creation of the target tables.

use tracing::info;
use vpic_core::{TableDefinition, MAKES, MODELS};

use crate::store::{quote_ident, quote_table, StoreError, TargetStore};

/// `CREATE TABLE IF NOT EXISTS` for one definition. Existing tables are never
/// altered, so re-running against a populated store is harmless.
pub fn render_create_table(table: &TableDefinition) -> String {
    let mut parts = table
        .columns
        .iter()
        .map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("{} {}{null}", quote_ident(&c.name), c.column_type.sql_type())
        })
        .collect::<Vec<_>>();
    if !table.primary_key.is_empty() {
        parts.push(format!(
            "PRIMARY KEY ({})",
            table
                .primary_key
                .iter()
                .map(|k| quote_ident(k))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_table(&table.name),
        parts.join(", ")
    )
}

#[derive(Debug, Clone)]
pub struct DdlBootstrapper {
    tables: Vec<TableDefinition>,
}

impl DdlBootstrapper {
    pub fn new(tables: Vec<TableDefinition>) -> Self {
        Self { tables }
    }

    /// The `makes` and `models` tables, in dependency order.
    pub fn for_catalog() -> Self {
        Self::new(vec![MAKES.store_definition(), MODELS.store_definition()])
    }

    pub fn statements(&self) -> Vec<String> {
        self.tables.iter().map(render_create_table).collect()
    }

    /// Script form for `migrate --print`.
    pub fn render_sql(&self) -> String {
        self.statements()
            .into_iter()
            .map(|s| format!("{s};\n"))
            .collect()
    }

    pub async fn ensure_schema(&self, store: &dyn TargetStore) -> Result<(), StoreError> {
        store.ensure_schema(&self.tables).await?;
        info!(
            tables = ?self.tables.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "schema ensured"
        );
        Ok(())
    }
}

impl Default for DdlBootstrapper {
    fn default() -> Self {
        Self::for_catalog()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use vpic_core::{CanonicalTable, CellValue, Column, ColumnType};

    use crate::load::StagingUpsertLoader;
    use crate::store::MemoryStore;

    #[test]
    fn makes_table_has_not_null_key_and_load_timestamp() {
        let sql = render_create_table(&MAKES.store_definition());
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"makes\" (\"make_id\" BIGINT NOT NULL, \"make_name\" TEXT, \
             \"load_timestamp\" TIMESTAMPTZ NOT NULL, PRIMARY KEY (\"make_id\"))"
        );
    }

    #[test]
    fn catalog_script_creates_both_tables() {
        let script = DdlBootstrapper::for_catalog().render_sql();
        assert_eq!(script.matches("CREATE TABLE IF NOT EXISTS").count(), 2);
        assert!(script.contains("PRIMARY KEY (\"model_id\")"));
    }

    #[tokio::test]
    async fn bootstrap_twice_keeps_existing_rows() {
        let store = Arc::new(MemoryStore::new());
        let ddl = DdlBootstrapper::for_catalog();
        ddl.ensure_schema(store.as_ref()).await.expect("first");
        let def = store.definition("makes").await.expect("makes created");
        assert_eq!(def.primary_key, vec!["make_id".to_string()]);

        let loaded_at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let makes = CanonicalTable::from_rows(
            vec![
                Column::new("make_id", ColumnType::Integer),
                Column::new("make_name", ColumnType::Text),
                Column::new("load_timestamp", ColumnType::Timestamp),
            ],
            vec![vec![
                CellValue::Integer(440),
                CellValue::text("ASTON MARTIN"),
                CellValue::Timestamp(loaded_at),
            ]],
        );
        let inserted = StagingUpsertLoader::new(store.clone())
            .load(&makes, "makes", &["make_id".to_string()], None)
            .await
            .expect("load");
        assert_eq!(inserted.inserted, 1);
        let before = store.rows("makes").await.expect("makes rows");

        ddl.ensure_schema(store.as_ref()).await.expect("second");
        assert_eq!(store.rows("makes").await, Some(before));
        assert_eq!(store.definition("makes").await, Some(def));
        assert_eq!(store.rows("models").await, Some(Vec::<Vec<CellValue>>::new()));
    }
}
