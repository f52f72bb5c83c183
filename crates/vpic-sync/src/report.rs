//! Per-make model counts for the end-of-run report.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use vpic_core::CanonicalTable;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MakeModelCount {
    pub make_name: String,
    pub count: usize,
}

/// One entry per distinct make name, in the makes table's order, with the
/// number of model rows carrying that name (0 when none).
pub fn count_models_per_make(makes: &CanonicalTable, models: &CanonicalTable) -> Vec<MakeModelCount> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for name in models.column_values("Make_Name").unwrap_or_default() {
        if !name.is_null() {
            *counts.entry(name.to_string()).or_default() += 1;
        }
    }

    let mut seen = HashSet::new();
    makes
        .column_values("Make_Name")
        .unwrap_or_default()
        .into_iter()
        .map(|name| name.to_string())
        .filter(|name| seen.insert(name.clone()))
        .map(|make_name| MakeModelCount {
            count: counts.get(&make_name).copied().unwrap_or(0),
            make_name,
        })
        .collect()
}

/// Fixed-width `name  count` lines for the run log.
pub fn render_counts(counts: &[MakeModelCount]) -> String {
    let width = counts
        .iter()
        .map(|c| c.make_name.chars().count())
        .max()
        .unwrap_or(0)
        .max("Make_Name".len());
    let mut lines = vec![format!("{:<width$}  Count", "Make_Name")];
    lines.extend(
        counts
            .iter()
            .map(|c| format!("{:<width$}  {}", c.make_name, c.count)),
    );
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpic_core::{CellValue, Column, ColumnType};

    fn table(columns: &[&str], rows: Vec<Vec<CellValue>>) -> CanonicalTable {
        CanonicalTable::from_rows(
            columns
                .iter()
                .map(|c| Column::new(*c, ColumnType::Text))
                .collect(),
            rows,
        )
    }

    #[test]
    fn counts_follow_makes_order_with_zeroes() {
        let makes = table(
            &["Make_Name"],
            vec![
                vec![CellValue::text("ASTON MARTIN")],
                vec![CellValue::text("HONDA")],
                vec![CellValue::text("TOYOTA")],
                vec![CellValue::text("HONDA")],
            ],
        );
        let models = table(
            &["Make_Name", "Model_Name"],
            vec![
                vec![CellValue::text("HONDA"), CellValue::text("Civic")],
                vec![CellValue::text("ASTON MARTIN"), CellValue::text("DB9")],
                vec![CellValue::text("HONDA"), CellValue::text("Accord")],
                vec![CellValue::text("LOTUS"), CellValue::text("Elise")],
            ],
        );
        let counts = count_models_per_make(&makes, &models);
        assert_eq!(
            counts,
            vec![
                MakeModelCount { make_name: "ASTON MARTIN".into(), count: 1 },
                MakeModelCount { make_name: "HONDA".into(), count: 2 },
                MakeModelCount { make_name: "TOYOTA".into(), count: 0 },
            ]
        );
        let rendered = render_counts(&counts);
        assert_eq!(rendered.lines().count(), 4);
        assert!(rendered.lines().nth(2).unwrap().ends_with(" 2"));
    }
}
