//! Applies mutation plans and request lists to a sheet store in bounded, ordered chunks.

use std::fmt;

use fmo_core::{RangeWrite, SheetRequest, HEADER_ROW, STAMP_CELL};
use fmo_storage::{SheetStore, StoreError};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::plan::MutationPlan;

/// Logical phases of a sheet sync; failures are contained at these boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fetch,
    Read,
    Plan,
    Header,
    Updates,
    Inserts,
    Stamp,
    Visibility,
    Format,
}

impl Phase {
    /// Phases that change cell values, as opposed to cosmetics.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Header | Self::Updates | Self::Inserts)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fetch => "fetch",
            Self::Read => "read",
            Self::Plan => "plan",
            Self::Header => "header",
            Self::Updates => "updates",
            Self::Inserts => "inserts",
            Self::Stamp => "stamp",
            Self::Visibility => "visibility",
            Self::Format => "format",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseFailure {
    pub phase: Phase,
    pub message: String,
}

/// Item counts: rows for data phases, requests for the others.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
    pub failures: Vec<PhaseFailure>,
}

impl ApplyReport {
    pub fn absorb(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
    }

    pub fn data_failed(&self) -> bool {
        self.failures.iter().any(|f| f.phase.is_data())
    }
}

pub struct SyncExecutor<'a> {
    store: &'a dyn SheetStore,
    max_batch: usize,
}

impl<'a> SyncExecutor<'a> {
    pub fn new(store: &'a dyn SheetStore, max_batch: usize) -> Self {
        Self {
            store,
            max_batch: max_batch.max(1),
        }
    }

    /// Data phases of a plan. A virgin plan is one block write of header plus rows;
    /// otherwise updates go first (addresses are only valid before inserts shift rows),
    /// then inserts from `insert_at` downwards.
    pub async fn apply(&self, plan: &MutationPlan) -> ApplyReport {
        let mut report = ApplyReport::default();

        if let Some(header) = &plan.header {
            let mut values = Vec::with_capacity(plan.inserts.len() + 1);
            values.push(header.clone());
            values.extend(plan.inserts.iter().cloned());
            let block = RangeWrite {
                row: HEADER_ROW,
                col: 0,
                values,
            };
            match self.store.write_ranges(&[block]).await {
                Ok(()) => report.applied += plan.inserts.len(),
                Err(err) => {
                    report.skipped += plan.inserts.len();
                    self.fail(&mut report, Phase::Header, err);
                }
            }
            return report;
        }

        for chunk in plan.updates.chunks(self.max_batch) {
            let writes: Vec<RangeWrite> = chunk
                .iter()
                .map(|update| RangeWrite::row_at(update.row, update.values.clone()))
                .collect();
            match self.store.write_ranges(&writes).await {
                Ok(()) => report.applied += chunk.len(),
                Err(err) => {
                    report.skipped += chunk.len();
                    self.fail(&mut report, Phase::Updates, err);
                }
            }
        }

        let mut anchor = plan.insert_at;
        let mut chunks = plan.inserts.chunks(self.max_batch);
        while let Some(chunk) = chunks.next() {
            match self.store.insert_rows(anchor, chunk, true).await {
                Ok(()) => {
                    report.applied += chunk.len();
                    anchor += chunk.len() as u32;
                }
                Err(err) => {
                    // Later chunks would leave a gap and break the date order.
                    report.skipped += chunk.len() + chunks.map(<[_]>::len).sum::<usize>();
                    self.fail(&mut report, Phase::Inserts, err);
                    break;
                }
            }
        }

        debug!(
            worksheet = self.store.worksheet(),
            applied = report.applied,
            skipped = report.skipped,
            "data phases applied"
        );
        report
    }

    /// Structural requests in order; a failed chunk does not stop the following ones.
    pub async fn apply_requests(&self, phase: Phase, requests: &[SheetRequest]) -> ApplyReport {
        let mut report = ApplyReport::default();
        for chunk in requests.chunks(self.max_batch) {
            match self.store.batch_update(chunk).await {
                Ok(()) => report.applied += chunk.len(),
                Err(err) => {
                    report.skipped += chunk.len();
                    self.fail(&mut report, phase, err);
                }
            }
        }
        report
    }

    pub async fn stamp(&self, text: String) -> ApplyReport {
        let (row, col) = STAMP_CELL;
        let write = RangeWrite {
            row,
            col,
            values: vec![vec![text]],
        };
        let mut report = ApplyReport::default();
        match self.store.write_ranges(&[write]).await {
            Ok(()) => report.applied += 1,
            Err(err) => {
                report.skipped += 1;
                self.fail(&mut report, Phase::Stamp, err);
            }
        }
        report
    }

    fn fail(&self, report: &mut ApplyReport, phase: Phase, source: StoreError) {
        let err = SyncError::ExternalCall {
            phase,
            worksheet: self.store.worksheet().to_string(),
            source,
        };
        warn!(error = %err, "store call failed; skipping this group");
        report.failures.push(PhaseFailure {
            phase,
            message: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::RowUpdate;
    use fmo_core::RowSpan;
    use fmo_storage::{MemorySheet, StoreOp};

    fn row(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn seeded() -> MemorySheet {
        MemorySheet::with_rows(
            "Daily",
            vec![
                row(&[]),
                row(&["Date", "Qty"]),
                row(&["01.01.2024", "1"]),
                row(&["02.01.2024", "2"]),
            ],
        )
    }

    #[tokio::test]
    async fn virgin_plan_is_a_single_block_write() {
        let sheet = MemorySheet::new("Daily");
        let plan = MutationPlan {
            header: Some(row(&["Date", "Qty"])),
            inserts: vec![row(&["01.01.2024", "1"]), row(&["02.01.2024", "2"])],
            insert_at: 3,
            ..MutationPlan::default()
        };
        let report = SyncExecutor::new(&sheet, 500).apply(&plan).await;

        assert_eq!(report.applied, 2);
        assert_eq!(sheet.calls(), vec![StoreOp::WriteRanges]);
        assert_eq!(sheet.snapshot().cell(2, 0), "Date");
        assert_eq!(sheet.snapshot().cell(4, 1), "2");
    }

    #[tokio::test]
    async fn updates_and_inserts_are_chunked_in_order() {
        let sheet = seeded();
        let plan = MutationPlan {
            updates: vec![
                RowUpdate {
                    row: 3,
                    values: row(&["01.01.2024", "10"]),
                },
                RowUpdate {
                    row: 4,
                    values: row(&["02.01.2024", "20"]),
                },
            ],
            inserts: vec![
                row(&["03.01.2024", "3"]),
                row(&["04.01.2024", "4"]),
                row(&["05.01.2024", "5"]),
            ],
            insert_at: 5,
            ..MutationPlan::default()
        };
        let report = SyncExecutor::new(&sheet, 2).apply(&plan).await;

        assert_eq!(report.applied, 5);
        assert_eq!(
            sheet.calls(),
            vec![StoreOp::WriteRanges, StoreOp::InsertRows, StoreOp::InsertRows]
        );
        let snap = sheet.snapshot();
        assert_eq!(snap.cell(4, 1), "20");
        let dates: Vec<_> = (5..=7).map(|r| snap.cell(r, 0).to_string()).collect();
        assert_eq!(dates, vec!["03.01.2024", "04.01.2024", "05.01.2024"]);
    }

    #[tokio::test]
    async fn failed_insert_chunk_skips_the_rest() {
        let sheet = seeded();
        sheet.fail_on(StoreOp::InsertRows);
        let plan = MutationPlan {
            inserts: vec![row(&["03.01.2024"]), row(&["04.01.2024"]), row(&["05.01.2024"])],
            insert_at: 5,
            ..MutationPlan::default()
        };
        let report = SyncExecutor::new(&sheet, 1).apply(&plan).await;

        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped, 3);
        assert_eq!(sheet.calls(), vec![StoreOp::InsertRows]);
        assert!(report.data_failed());
    }

    #[tokio::test]
    async fn cosmetic_failures_are_reported_not_raised() {
        let sheet = seeded();
        sheet.fail_on(StoreOp::BatchUpdate);
        let requests = vec![SheetRequest::SetRowsHidden {
            rows: RowSpan::single(3),
            hidden: true,
        }];
        let report = SyncExecutor::new(&sheet, 500)
            .apply_requests(Phase::Visibility, &requests)
            .await;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.failures[0].phase, Phase::Visibility);
        assert!(!report.data_failed());
        assert!(sheet.hidden_rows().is_empty());
    }

    #[tokio::test]
    async fn stamp_lands_in_f1() {
        let sheet = seeded();
        let report = SyncExecutor::new(&sheet, 500)
            .stamp("Updated: 01.01.2024 10:00:00".to_string())
            .await;
        assert_eq!(report.applied, 1);
        assert_eq!(sheet.snapshot().cell(1, 5), "Updated: 01.01.2024 10:00:00");
    }
}
