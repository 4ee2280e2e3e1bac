//! In-process sheet store with the same observable semantics as the HTTP store: trailing
//! blank cells are trimmed on read, inserted rows push later rows (and their hidden flags)
//! down, and every call is logged. Failures can be injected per operation kind.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use fmo_core::{RangeWrite, SheetRequest, SheetSnapshot};

use crate::{SheetBackend, SheetStore, StoreError, StoreOp};

#[derive(Debug, Clone)]
pub struct MemorySheet {
    title: String,
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    cells: Vec<Vec<String>>,
    hidden: BTreeSet<u32>,
    formats: Vec<SheetRequest>,
    calls: Vec<StoreOp>,
    failing: HashSet<StoreOp>,
}

impl MemorySheet {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            state: Arc::default(),
        }
    }

    pub fn with_rows(title: impl Into<String>, rows: Vec<Vec<String>>) -> Self {
        let sheet = Self::new(title);
        sheet.lock().cells = rows;
        sheet
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current values, trimmed the way a read would return them.
    pub fn snapshot(&self) -> SheetSnapshot {
        self.lock().snapshot()
    }

    pub fn hidden_rows(&self) -> Vec<u32> {
        self.lock().hidden.iter().copied().collect()
    }

    pub fn format_log(&self) -> Vec<SheetRequest> {
        self.lock().formats.clone()
    }

    pub fn calls(&self) -> Vec<StoreOp> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn fail_on(&self, op: StoreOp) {
        self.lock().failing.insert(op);
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Overwrites one cell, growing the grid as needed; simulates a manual edit.
    pub fn set_cell(&self, row: u32, col: usize, value: impl Into<String>) {
        self.lock().write_block(&RangeWrite {
            row,
            col,
            values: vec![vec![value.into()]],
        });
    }

    fn begin(&self, op: StoreOp) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let mut state = self.lock();
        state.calls.push(op);
        if state.failing.contains(&op) {
            return Err(StoreError::Rejected { op });
        }
        Ok(state)
    }
}

impl MemoryState {
    fn snapshot(&self) -> SheetSnapshot {
        let rows = self
            .cells
            .iter()
            .map(|row| {
                let keep = row
                    .iter()
                    .rposition(|cell| !cell.is_empty())
                    .map_or(0, |idx| idx + 1);
                row[..keep].to_vec()
            })
            .collect();
        SheetSnapshot::new(rows)
    }

    fn write_block(&mut self, write: &RangeWrite) {
        for (offset, values) in write.values.iter().enumerate() {
            let idx = (write.row as usize).saturating_sub(1) + offset;
            if self.cells.len() <= idx {
                self.cells.resize_with(idx + 1, Vec::new);
            }
            let row = &mut self.cells[idx];
            if row.len() < write.col + values.len() {
                row.resize(write.col + values.len(), String::new());
            }
            for (col, value) in values.iter().enumerate() {
                row[write.col + col] = value.clone();
            }
        }
    }
}

#[async_trait]
impl SheetStore for MemorySheet {
    fn worksheet(&self) -> &str {
        &self.title
    }

    async fn read_all_values(&self) -> Result<SheetSnapshot, StoreError> {
        let state = self.begin(StoreOp::Read)?;
        Ok(state.snapshot())
    }

    async fn write_ranges(&self, writes: &[RangeWrite]) -> Result<(), StoreError> {
        let mut state = self.begin(StoreOp::WriteRanges)?;
        for write in writes {
            if write.row == 0 {
                return Err(StoreError::Invalid("rows are 1-based".to_string()));
            }
            state.write_block(write);
        }
        Ok(())
    }

    async fn insert_rows(
        &self,
        anchor_row: u32,
        rows: &[Vec<String>],
        _inherit_format: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.begin(StoreOp::InsertRows)?;
        if anchor_row == 0 {
            return Err(StoreError::Invalid("rows are 1-based".to_string()));
        }
        let at = anchor_row as usize - 1;
        if state.cells.len() < at {
            state.cells.resize_with(at, Vec::new);
        }
        state.cells.splice(at..at, rows.iter().cloned());

        let shift = rows.len() as u32;
        state.hidden = state
            .hidden
            .iter()
            .map(|&row| if row >= anchor_row { row + shift } else { row })
            .collect();
        Ok(())
    }

    async fn batch_update(&self, requests: &[SheetRequest]) -> Result<(), StoreError> {
        let mut state = self.begin(StoreOp::BatchUpdate)?;
        for request in requests {
            match request {
                SheetRequest::SetRowsHidden { rows, hidden } => {
                    for row in rows.start..rows.end {
                        if *hidden {
                            state.hidden.insert(row);
                        } else {
                            state.hidden.remove(&row);
                        }
                    }
                }
                other => state.formats.push(other.clone()),
            }
        }
        Ok(())
    }
}

/// Named in-memory worksheets; opening an unknown title creates a blank one.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    sheets: Arc<Mutex<HashMap<String, MemorySheet>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sheet: MemorySheet) {
        self.sheets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sheet.title.clone(), sheet);
    }

    pub fn sheet(&self, title: &str) -> MemorySheet {
        self.sheets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(title.to_string())
            .or_insert_with(|| MemorySheet::new(title))
            .clone()
    }
}

impl SheetBackend for MemoryBackend {
    fn open(&self, worksheet: &str) -> Arc<dyn SheetStore> {
        Arc::new(self.sheet(worksheet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fmo_core::RowSpan;

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn reads_trim_trailing_blank_cells_and_rows() {
        let sheet = MemorySheet::with_rows(
            "Daily",
            vec![strings(&["", "x", "", ""]), strings(&["a"]), strings(&["", ""])],
        );
        let snap = sheet.read_all_values().await.unwrap();
        assert_eq!(snap.rows(), &[strings(&["", "x"]), strings(&["a"])]);
    }

    #[tokio::test]
    async fn inserted_rows_shift_hidden_flags_down() {
        let sheet = MemorySheet::with_rows(
            "Daily",
            vec![strings(&["meta"]), strings(&["Date"]), strings(&["01.01.2024"])],
        );
        sheet
            .batch_update(&[SheetRequest::SetRowsHidden {
                rows: RowSpan::single(3),
                hidden: true,
            }])
            .await
            .unwrap();
        sheet
            .insert_rows(3, &[strings(&["31.12.2023"])], true)
            .await
            .unwrap();

        assert_eq!(sheet.snapshot().cell(3, 0), "31.12.2023");
        assert_eq!(sheet.snapshot().cell(4, 0), "01.01.2024");
        assert_eq!(sheet.hidden_rows(), vec![4]);
    }

    #[tokio::test]
    async fn injected_failures_are_logged_and_leave_state_untouched() {
        let sheet = MemorySheet::new("Daily");
        sheet.fail_on(StoreOp::WriteRanges);
        let err = sheet
            .write_ranges(&[RangeWrite::row_at(3, strings(&["x"]))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { op: StoreOp::WriteRanges }));
        assert!(sheet.snapshot().is_blank());
        assert_eq!(sheet.calls(), vec![StoreOp::WriteRanges]);
    }

    #[test]
    fn backend_hands_out_shared_handles() {
        let backend = MemoryBackend::new();
        backend.sheet("Orders").set_cell(1, 5, "stamp");
        assert_eq!(backend.sheet("Orders").snapshot().cell(1, 5), "stamp");
    }
}
