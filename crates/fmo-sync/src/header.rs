//! Header resolution: binds the titles found in row 2 to logical fields.

use std::collections::HashMap;

use fmo_core::{Granularity, LogicalField, SheetSnapshot, HEADER_ROW};
use tracing::{debug, warn};

use crate::config::SheetLayout;
use crate::error::SyncError;

/// Logical field → column index for one snapshot. Rebuilt on every read; column positions
/// go stale as soon as someone inserts or deletes a column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMap {
    header: Vec<String>,
    bindings: Vec<Option<LogicalField>>,
    positions: HashMap<LogicalField, usize>,
    date_col: usize,
    order_col: Option<usize>,
    granularity: Granularity,
}

impl ColumnMap {
    /// Map of the header a virgin sheet receives from its layout.
    pub fn canonical(layout: &SheetLayout) -> Result<Self, SyncError> {
        let header = layout.header();
        let bindings = layout.columns.iter().map(|c| Some(c.field.clone())).collect();
        Self::from_bindings(header, bindings, layout.granularity)
            .ok_or_else(|| missing_key_column(layout))
    }

    fn from_bindings(
        header: Vec<String>,
        bindings: Vec<Option<LogicalField>>,
        granularity: Granularity,
    ) -> Option<Self> {
        let positions: HashMap<LogicalField, usize> = bindings
            .iter()
            .enumerate()
            .filter_map(|(col, field)| field.clone().map(|field| (field, col)))
            .collect();
        let date_col = *positions.get(&LogicalField::Date)?;
        let order_col = match granularity {
            Granularity::Daily => None,
            Granularity::Order => Some(*positions.get(&LogicalField::Order)?),
        };
        Some(Self {
            header,
            bindings,
            positions,
            date_col,
            order_col,
            granularity,
        })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Number of header columns; every written row spans exactly this many cells.
    pub fn width(&self) -> usize {
        self.header.len()
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn date_col(&self) -> usize {
        self.date_col
    }

    pub fn order_col(&self) -> Option<usize> {
        self.order_col
    }

    pub fn column_of(&self, field: &LogicalField) -> Option<usize> {
        self.positions.get(field).copied()
    }

    pub fn binding(&self, col: usize) -> Option<&LogicalField> {
        self.bindings.get(col).and_then(Option::as_ref)
    }
}

fn missing_key_column(layout: &SheetLayout) -> SyncError {
    let field = match layout.granularity {
        Granularity::Order if layout.title_of(&LogicalField::Date).is_some() => LogicalField::Order,
        _ => LogicalField::Date,
    };
    SyncError::MissingColumn {
        worksheet: layout.worksheet.clone(),
        column: layout.title_of(&field).unwrap_or_default().to_string(),
        field,
        row: HEADER_ROW,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderState {
    /// No non-empty cell anywhere: write header and data in one go.
    Virgin,
    Resolved(ColumnMap),
}

/// Binds header cells to the layout's titles by exact trimmed equality. Metric titles the
/// sheet lacks stay unmapped; missing key columns abort this worksheet.
pub fn resolve(snapshot: &SheetSnapshot, layout: &SheetLayout) -> Result<HeaderState, SyncError> {
    if snapshot.is_blank() {
        return Ok(HeaderState::Virgin);
    }

    let titles: HashMap<&str, &LogicalField> = layout
        .columns
        .iter()
        .map(|c| (c.title.trim(), &c.field))
        .collect();

    let header_cells = snapshot.row(HEADER_ROW).unwrap_or_default();
    let mut bound: HashMap<&LogicalField, usize> = HashMap::new();
    let mut bindings = Vec::with_capacity(header_cells.len());
    for (col, cell) in header_cells.iter().enumerate() {
        let binding = match titles.get(cell.trim()) {
            Some(field) => match bound.get(field) {
                Some(&first) => {
                    warn!(
                        worksheet = %layout.worksheet,
                        title = cell.trim(),
                        first_col = first,
                        col,
                        "duplicate header title; only the first column is written"
                    );
                    None
                }
                None => {
                    bound.insert(*field, col);
                    Some((*field).clone())
                }
            },
            None => None,
        };
        bindings.push(binding);
    }

    for field in layout.required_fields() {
        if !bound.contains_key(&field) {
            return Err(SyncError::MissingColumn {
                worksheet: layout.worksheet.clone(),
                column: layout.title_of(&field).unwrap_or_default().to_string(),
                field,
                row: HEADER_ROW,
            });
        }
    }

    for column in &layout.columns {
        if !bound.contains_key(&column.field) {
            debug!(worksheet = %layout.worksheet, title = %column.title, "configured column not on sheet");
        }
    }

    ColumnMap::from_bindings(header_cells.to_vec(), bindings, layout.granularity)
        .map(HeaderState::Resolved)
        .ok_or_else(|| missing_key_column(layout))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{ColumnSpec, FormatStyle};
    use crate::window::VisibilityMode;

    pub(crate) fn layout(granularity: Granularity, columns: &[(&str, &str)]) -> SheetLayout {
        SheetLayout {
            worksheet: "Test".to_string(),
            enabled: true,
            granularity,
            columns: columns
                .iter()
                .map(|(title, field)| ColumnSpec {
                    title: title.to_string(),
                    field: LogicalField::from(field.to_string()),
                })
                .collect(),
            visibility: VisibilityMode::default(),
            style: FormatStyle::default(),
            highlight_today: true,
            fill_missing_days: false,
            stamp_label: "Updated:".to_string(),
        }
    }

    pub(crate) fn snapshot(rows: &[&[&str]]) -> SheetSnapshot {
        SheetSnapshot::new(
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    fn daily() -> SheetLayout {
        layout(
            Granularity::Daily,
            &[("Date", "date"), ("Windows", "qty_izd_pvh"), ("Iron", "qty_iron")],
        )
    }

    #[test]
    fn empty_sheet_is_virgin() {
        assert_eq!(resolve(&snapshot(&[]), &daily()).unwrap(), HeaderState::Virgin);
        assert_eq!(
            resolve(&snapshot(&[&["", " "], &[""]]), &daily()).unwrap(),
            HeaderState::Virgin
        );
    }

    #[test]
    fn reordered_and_padded_titles_resolve() {
        let snap = snapshot(&[&["", "", "", "", "", "stamp"], &[" Iron", "Note", "Date "]]);
        let HeaderState::Resolved(map) = resolve(&snap, &daily()).unwrap() else {
            panic!("expected a resolved header");
        };
        assert_eq!(map.date_col(), 2);
        assert_eq!(map.column_of(&LogicalField::Metric("qty_iron".into())), Some(0));
        assert_eq!(map.column_of(&LogicalField::Metric("qty_izd_pvh".into())), None);
        assert_eq!(map.binding(1), None);
        assert_eq!(map.width(), 3);
    }

    #[test]
    fn missing_date_column_is_reported() {
        let snap = snapshot(&[&[], &["Day", "Windows"]]);
        let err = resolve(&snap, &daily()).unwrap_err();
        assert!(matches!(
            err,
            SyncError::MissingColumn { ref column, field: LogicalField::Date, row: 2, .. }
                if column == "Date"
        ));
    }

    #[test]
    fn order_sheet_requires_order_column() {
        let orders = layout(Granularity::Order, &[("Date", "date"), ("Order", "order")]);
        let snap = snapshot(&[&[], &["Date", "Qty"]]);
        assert!(matches!(
            resolve(&snap, &orders),
            Err(SyncError::MissingColumn { field: LogicalField::Order, .. })
        ));
    }

    #[test]
    fn duplicate_title_binds_first_column_only() {
        let snap = snapshot(&[&[], &["Date", "Iron", "Iron"]]);
        let HeaderState::Resolved(map) = resolve(&snap, &daily()).unwrap() else {
            panic!("expected a resolved header");
        };
        assert_eq!(map.column_of(&LogicalField::Metric("qty_iron".into())), Some(1));
        assert_eq!(map.binding(2), None);
    }

    #[test]
    fn canonical_map_follows_layout_order() {
        let map = ColumnMap::canonical(&daily()).unwrap();
        assert_eq!(map.header(), ["Date", "Windows", "Iron"]);
        assert_eq!(map.date_col(), 0);
        assert_eq!(map.order_col(), None);
    }
}
