//! Diff planning: partitions merged records into row updates and appended rows.

use std::collections::HashSet;

use fmo_core::{
    format_date, format_quantity, parse_date, AggregateRecord, CompositeKey, LogicalField,
    DATA_START_ROW,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SheetLayout;
use crate::error::SyncError;
use crate::header::ColumnMap;
use crate::index::SheetIndex;
use crate::key::{merge_records, DroppedRecord, KeyedRecord};

/// Whole-row overwrite of an existing data row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowUpdate {
    pub row: u32,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MutationPlan {
    /// Set only for a virgin sheet; written together with `inserts` in one block.
    pub header: Option<Vec<String>>,
    pub updates: Vec<RowUpdate>,
    /// New rows in ascending date order.
    pub inserts: Vec<Vec<String>>,
    /// First row the inserts occupy.
    pub insert_at: u32,
    /// Records whose row already holds exactly the projected values.
    pub unchanged: usize,
    pub dropped: Vec<DroppedRecord>,
}

impl MutationPlan {
    pub fn is_noop(&self) -> bool {
        self.header.is_none() && self.updates.is_empty() && self.inserts.is_empty()
    }
}

/// Projects a record onto the sheet's own column order. Mapped metrics the record lacks
/// read as zero; columns with no logical field are blank.
pub fn project(record: &AggregateRecord, map: &ColumnMap) -> Vec<String> {
    (0..map.width())
        .map(|col| match map.binding(col) {
            Some(LogicalField::Date) => record.date.map(format_date).unwrap_or_default(),
            Some(LogicalField::Order) => record
                .order_no
                .as_deref()
                .map(|order| order.trim().to_string())
                .unwrap_or_default(),
            Some(LogicalField::Metric(name)) => format_quantity(record.metric(name)),
            None => String::new(),
        })
        .collect()
}

pub fn plan(records: &[AggregateRecord], index: &SheetIndex, map: &ColumnMap) -> MutationPlan {
    let merged = merge_records(records.iter().cloned(), map.granularity());
    let mut plan = MutationPlan {
        insert_at: (index.row_count() + 1).max(DATA_START_ROW),
        dropped: merged.dropped,
        ..MutationPlan::default()
    };

    let mut pending_keys: HashSet<CompositeKey> = HashSet::new();
    let mut pending = Vec::new();
    for KeyedRecord { key, record } in merged.records {
        let values = project(&record, map);
        match index.get(&key) {
            Some(existing) if row_matches(&existing.values, &values) => plan.unchanged += 1,
            Some(existing) => plan.updates.push(RowUpdate {
                row: existing.row,
                values,
            }),
            None => {
                if pending_keys.insert(key.clone()) {
                    pending.push(values);
                } else {
                    warn!(%key, "second insert for the same key skipped");
                }
            }
        }
    }

    plan.inserts = sort_by_date(pending, map.date_col());
    debug!(
        updates = plan.updates.len(),
        inserts = plan.inserts.len(),
        unchanged = plan.unchanged,
        dropped = plan.dropped.len(),
        "mutation plan built"
    );
    plan
}

/// Plan for a sheet with no content at all: canonical header plus every record as a new
/// row. Nothing to write means no header either.
pub fn plan_virgin(
    records: &[AggregateRecord],
    layout: &SheetLayout,
) -> Result<MutationPlan, SyncError> {
    let map = ColumnMap::canonical(layout)?;
    let merged = merge_records(records.iter().cloned(), layout.granularity);
    let rows = merged
        .records
        .iter()
        .map(|keyed| project(&keyed.record, &map))
        .collect::<Vec<_>>();

    Ok(MutationPlan {
        header: (!rows.is_empty()).then(|| map.header().to_vec()),
        inserts: sort_by_date(rows, map.date_col()),
        insert_at: DATA_START_ROW,
        dropped: merged.dropped,
        ..MutationPlan::default()
    })
}

// Stores trim trailing blanks, so the existing row may be shorter than the projection.
fn row_matches(existing: &[String], values: &[String]) -> bool {
    values.iter().enumerate().all(|(col, value)| {
        existing.get(col).map(String::as_str).unwrap_or("") == value.as_str()
    })
}

/// Stable ascending sort on the date cell. One unparseable date leaves the batch as is.
fn sort_by_date(rows: Vec<Vec<String>>, date_col: usize) -> Vec<Vec<String>> {
    let parsed: Option<Vec<_>> = rows
        .iter()
        .map(|row| row.get(date_col).and_then(|cell| parse_date(cell)))
        .collect();
    let Some(dates) = parsed else {
        warn!(rows = rows.len(), "unparseable date among new rows; keeping source order");
        return rows;
    };
    let mut keyed: Vec<_> = dates.into_iter().zip(rows).collect();
    keyed.sort_by_key(|(date, _)| *date);
    keyed.into_iter().map(|(_, row)| row).collect()
}
