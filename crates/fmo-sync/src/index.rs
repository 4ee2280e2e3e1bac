//! Lookup of existing data rows by composite key.

use std::collections::HashMap;

use fmo_core::{CompositeKey, SheetSnapshot};
use serde::Serialize;
use tracing::warn;

use crate::header::ColumnMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedRow {
    /// Absolute 1-based sheet row.
    pub row: u32,
    pub values: Vec<String>,
}

/// A key that appeared on more than one data row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateKey {
    pub key: CompositeKey,
    pub shadowed_row: u32,
    pub kept_row: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SheetIndex {
    rows: HashMap<CompositeKey, IndexedRow>,
    row_count: u32,
    duplicates: Vec<DuplicateKey>,
}

impl SheetIndex {
    /// Keys every data row from its raw date (and order) cells. Cells are compared byte
    /// for byte with record keys; nothing is re-parsed. Rows with an empty key cell are
    /// not indexed, and when a key repeats the last row wins.
    pub fn build(snapshot: &SheetSnapshot, map: &ColumnMap) -> Self {
        let mut index = Self {
            row_count: snapshot.row_count(),
            ..Self::default()
        };

        for (row, cells) in snapshot.data_rows() {
            let cell = |col: usize| cells.get(col).map(String::as_str).unwrap_or("");
            let date = cell(map.date_col());
            if date.is_empty() {
                continue;
            }
            let key = match map.order_col() {
                None => CompositeKey::daily(date),
                Some(col) if cell(col).is_empty() => continue,
                Some(col) => CompositeKey::order(date, cell(col)),
            };

            let entry = IndexedRow {
                row,
                values: cells.to_vec(),
            };
            if let Some(previous) = index.rows.insert(key.clone(), entry) {
                warn!(%key, shadowed_row = previous.row, kept_row = row, "duplicate key on sheet");
                index.duplicates.push(DuplicateKey {
                    key,
                    shadowed_row: previous.row,
                    kept_row: row,
                });
            }
        }
        index
    }

    pub fn get(&self, key: &CompositeKey) -> Option<&IndexedRow> {
        self.rows.get(key)
    }

    pub fn row_of(&self, key: &CompositeKey) -> Option<u32> {
        self.get(key).map(|entry| entry.row)
    }

    /// Row count of the snapshot the index was built from; inserts start right after it.
    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn duplicates(&self) -> &[DuplicateKey] {
        &self.duplicates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::tests::{layout, snapshot};
    use crate::header::{resolve, HeaderState};
    use fmo_core::Granularity;

    fn map_for(snap: &SheetSnapshot, granularity: Granularity) -> ColumnMap {
        let layout = layout(
            granularity,
            &[("Date", "date"), ("Order", "order"), ("Qty", "qty_izd_pvh")],
        );
        match resolve(snap, &layout).unwrap() {
            HeaderState::Resolved(map) => map,
            HeaderState::Virgin => panic!("expected a header"),
        }
    }

    #[test]
    fn rows_are_indexed_from_the_data_offset() {
        let snap = snapshot(&[
            &["01.01.2024"],
            &["Date", "Qty"],
            &["01.01.2024", "5"],
            &["02.01.2024", "7"],
        ]);
        let index = SheetIndex::build(&snap, &map_for(&snap, Granularity::Daily));
        assert_eq!(index.len(), 2);
        assert_eq!(index.row_of(&CompositeKey::daily("01.01.2024")), Some(3));
        assert_eq!(index.row_of(&CompositeKey::daily("02.01.2024")), Some(4));
        assert_eq!(index.row_count(), 4);
    }

    #[test]
    fn later_duplicate_wins_and_is_reported() {
        let snap = snapshot(&[
            &[],
            &["Date", "Order", "Qty"],
            &["01.03.2024", "42", "1"],
            &["01.03.2024", "43", "2"],
            &["01.03.2024", "42", "3"],
        ]);
        let index = SheetIndex::build(&snap, &map_for(&snap, Granularity::Order));
        let key = CompositeKey::order("01.03.2024", "42");
        assert_eq!(index.row_of(&key), Some(5));
        assert_eq!(index.get(&key).unwrap().values[2], "3");
        assert_eq!(
            index.duplicates(),
            &[DuplicateKey {
                key,
                shadowed_row: 3,
                kept_row: 5
            }]
        );
    }

    #[test]
    fn key_cells_are_matched_verbatim() {
        let snap = snapshot(&[
            &[],
            &["Date", "Qty"],
            &["1.1.2024", "5"],
            &["", "9"],
            &["03.01.2024 ", "1"],
        ]);
        let index = SheetIndex::build(&snap, &map_for(&snap, Granularity::Daily));
        assert_eq!(index.row_of(&CompositeKey::daily("01.01.2024")), None);
        assert_eq!(index.row_of(&CompositeKey::daily("03.01.2024")), None);
        assert_eq!(index.row_of(&CompositeKey::daily("1.1.2024")), Some(3));
        assert_eq!(index.len(), 2);
    }
}
