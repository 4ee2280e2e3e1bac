//! Reconciliation of production aggregates into dashboard worksheets: keying, header
//! resolution, row diffing, the visibility window and the batched executor, wired into
//! a scheduled pipeline.

pub mod config;
pub mod error;
pub mod executor;
pub mod header;
pub mod index;
pub mod key;
pub mod pipeline;
pub mod plan;
pub mod window;

pub use config::{load_sheet_registry, ColumnSpec, FormatStyle, SheetLayout, SheetRegistry, SyncConfig};
pub use error::SyncError;
pub use executor::{ApplyReport, Phase, PhaseFailure, SyncExecutor};
pub use header::{resolve, ColumnMap, HeaderState};
pub use index::{DuplicateKey, IndexedRow, SheetIndex};
pub use key::{
    fill_missing_days, key_of, merge_records, rollup_daily, DroppedRecord, KeyParseFailure,
    KeyedRecord, MergedRecords,
};
pub use pipeline::{
    build_scheduler, pipeline_from_env, records_for_layout, CycleStatus, CycleSummary,
    HeaderReport, SheetOutcome, SheetStatus, SyncContext, SyncPipeline,
};
pub use plan::{plan, plan_virgin, project, MutationPlan, RowUpdate};
pub use window::{format_plan, group_contiguous, window, VisibilityMode, VisibilityPlan};

pub const CRATE_NAME: &str = "fmo-sync";
