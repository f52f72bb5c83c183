//! Remaining-work selection against the already-loaded key ledger.

use std::collections::HashSet;
use std::hash::Hash;

use tracing::warn;
use vpic_core::{CanonicalTable, CellValue, WorkKey};

/// `all_keys - already_loaded`, in `all_keys` order, first `limit` entries.
///
/// Keys repeated in `all_keys` are returned once, at their first position.
pub fn select_remaining<K>(all_keys: &[K], already_loaded: &HashSet<K>, limit: Option<usize>) -> Vec<K>
where
    K: Eq + Hash + Clone,
{
    let mut emitted = HashSet::new();
    all_keys
        .iter()
        .filter(|k| !already_loaded.contains(*k))
        .filter(|k| emitted.insert((*k).clone()))
        .take(limit.unwrap_or(usize::MAX))
        .cloned()
        .collect()
}

/// Work keys of a canonical table, top to bottom. Non-integer cells cannot
/// address upstream work and are skipped.
pub fn work_keys(table: &CanonicalTable, column: &str) -> Vec<WorkKey> {
    let Some(values) = table.column_values(column) else {
        warn!(column, "key column absent; no work keys");
        return Vec::new();
    };
    values
        .into_iter()
        .enumerate()
        .filter_map(|(row, cell)| match cell.as_i64() {
            Some(key) => Some(key),
            None => {
                warn!(row, column, value = %cell, "skipping non-integer work key");
                None
            }
        })
        .collect()
}

/// Ledger cells -> key set; anything that is not an integer is ignored.
pub fn loaded_key_set(cells: &[CellValue]) -> HashSet<WorkKey> {
    cells.iter().filter_map(CellValue::as_i64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpic_core::{Column, ColumnType};

    #[test]
    fn difference_preserves_order_of_all_keys() {
        let all = vec![5, 3, 9, 1, 7];
        let loaded = HashSet::from([9, 5]);
        assert_eq!(select_remaining(&all, &loaded, None), vec![3, 1, 7]);
    }

    #[test]
    fn limit_takes_the_first_k_remaining() {
        let all = vec![5, 3, 9, 1, 7];
        let loaded = HashSet::from([3]);
        assert_eq!(select_remaining(&all, &loaded, Some(2)), vec![5, 9]);
        assert_eq!(select_remaining(&all, &loaded, Some(10)), vec![5, 9, 1, 7]);
        assert!(select_remaining(&all, &loaded, Some(0)).is_empty());
    }

    #[test]
    fn nothing_remaining_is_empty_not_an_error() {
        let all = vec![1, 2];
        let loaded = HashSet::from([1, 2, 3]);
        assert!(select_remaining(&all, &loaded, Some(5)).is_empty());
    }

    #[test]
    fn repeated_keys_are_emitted_once() {
        let all = vec![4, 2, 4, 1];
        assert_eq!(select_remaining(&all, &HashSet::new(), None), vec![4, 2, 1]);
    }

    #[test]
    fn work_keys_skip_non_integer_cells() {
        let table = CanonicalTable::from_rows(
            vec![Column::new("Make_ID", ColumnType::Integer)],
            vec![
                vec![CellValue::Integer(440)],
                vec![CellValue::text("oops")],
                vec![CellValue::Null],
                vec![CellValue::Integer(441)],
            ],
        );
        assert_eq!(work_keys(&table, "Make_ID"), vec![440, 441]);
        assert!(work_keys(&table, "Model_ID").is_empty());
    }

    #[test]
    fn ledger_ignores_non_integer_cells() {
        let cells = vec![
            CellValue::Integer(1),
            CellValue::text("x"),
            CellValue::Integer(1),
            CellValue::Null,
        ];
        assert_eq!(loaded_key_set(&cells), HashSet::from([1]));
    }
}
