//! Weakly-typed sheet vocabulary: snapshots, A1 addressing and structural requests.

use serde::{Deserialize, Serialize};

/// Row holding the column titles (1-based).
pub const HEADER_ROW: u32 = 2;

/// First row holding data (1-based). Row 1 carries metadata such as the stamp.
pub const DATA_START_ROW: u32 = 3;

/// Cell holding the "last updated" stamp: row 1, column F.
pub const STAMP_CELL: (u32, usize) = (1, 5);

/// Full read of a worksheet at one point in time.
///
/// Trailing blank rows are dropped on construction; stores may also omit trailing blank
/// cells of a row, so every read goes through [`SheetSnapshot::cell`], which yields `""`
/// for anything absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SheetSnapshot {
    rows: Vec<Vec<String>>,
}

impl SheetSnapshot {
    pub fn new(mut rows: Vec<Vec<String>>) -> Self {
        while rows
            .last()
            .is_some_and(|row| row.iter().all(|cell| cell.is_empty()))
        {
            rows.pop();
        }
        Self { rows }
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// Number of rows up to and including the last non-blank one.
    pub fn row_count(&self) -> u32 {
        self.rows.len() as u32
    }

    pub fn row(&self, row_number: u32) -> Option<&[String]> {
        let idx = row_number.checked_sub(1)? as usize;
        self.rows.get(idx).map(Vec::as_slice)
    }

    pub fn cell(&self, row_number: u32, col: usize) -> &str {
        self.row(row_number)
            .and_then(|row| row.get(col))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// True when no cell holds anything but whitespace.
    pub fn is_blank(&self) -> bool {
        self.rows
            .iter()
            .all(|row| row.iter().all(|cell| cell.trim().is_empty()))
    }

    /// Data rows with their absolute 1-based row numbers.
    pub fn data_rows(&self) -> impl Iterator<Item = (u32, &[String])> + '_ {
        self.rows
            .iter()
            .enumerate()
            .skip((DATA_START_ROW - 1) as usize)
            .map(|(idx, row)| (idx as u32 + 1, row.as_slice()))
    }
}

/// Column letters from a 0-based index: 0 → A, 25 → Z, 26 → AA.
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(char::from(b'A' + rem as u8));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

pub fn a1_cell(row: u32, col: usize) -> String {
    format!("{}{}", column_letter(col), row)
}

/// A1 range covering `height` rows and `width` columns from (`row`, `col`).
pub fn a1_range(row: u32, col: usize, height: usize, width: usize) -> String {
    let last_row = row + height.max(1) as u32 - 1;
    let last_col = col + width.max(1) - 1;
    if last_row == row && last_col == col {
        return a1_cell(row, col);
    }
    format!("{}:{}", a1_cell(row, col), a1_cell(last_row, last_col))
}

/// Block of values written at an anchor cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeWrite {
    pub row: u32,
    pub col: usize,
    pub values: Vec<Vec<String>>,
}

impl RangeWrite {
    pub fn row_at(row: u32, values: Vec<String>) -> Self {
        Self {
            row,
            col: 0,
            values: vec![values],
        }
    }

    pub fn width(&self) -> usize {
        self.values.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn a1(&self) -> String {
        a1_range(self.row, self.col, self.values.len(), self.width())
    }
}

/// Half-open span of 1-based sheet rows: `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RowSpan {
    pub start: u32,
    pub end: u32,
}

impl RowSpan {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn single(row: u32) -> Self {
        Self::new(row, row + 1)
    }

    /// Inclusive constructor, `first..=last`.
    pub fn through(first: u32, last: u32) -> Self {
        Self::new(first, last + 1)
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, row: u32) -> bool {
        (self.start..self.end).contains(&row)
    }
}

/// Rectangle of cells; `columns` is a half-open 0-based span, `None` meaning every column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CellRange {
    pub rows: RowSpan,
    pub columns: Option<(usize, usize)>,
}

impl CellRange {
    pub fn whole_rows(rows: RowSpan) -> Self {
        Self {
            rows,
            columns: None,
        }
    }

    pub fn columns(rows: RowSpan, start: usize, end: usize) -> Self {
        Self {
            rows,
            columns: Some((start, end)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
}

impl Color {
    pub const WHITE: Color = Color {
        red: 1.0,
        green: 1.0,
        blue: 1.0,
    };

    /// Light green used for the current day's rows.
    pub const TODAY_FILL: Color = Color {
        red: 0.85,
        green: 0.92,
        blue: 0.83,
    };
}

/// Structural (non-value) change sent through a store's batch-update call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SheetRequest {
    SetRowsHidden { rows: RowSpan, hidden: bool },
    TextStyle {
        range: CellRange,
        font_size: u32,
        bold: bool,
    },
    Background { range: CellRange, color: Color },
}
