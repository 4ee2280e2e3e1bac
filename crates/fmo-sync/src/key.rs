//! Record identity: composite keys, merging of partial records and the daily roll-up.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use fmo_core::{format_date, AggregateRecord, CompositeKey, Granularity};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
pub enum KeyParseFailure {
    #[error("record has no production date")]
    MissingDate,
    #[error("record dated {date} has no order number")]
    MissingOrder { date: String },
}

/// A record excluded from reconciliation; `position` indexes the fetched input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedRecord {
    pub position: usize,
    pub failure: KeyParseFailure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRecord {
    pub key: CompositeKey,
    pub record: AggregateRecord,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedRecords {
    pub records: Vec<KeyedRecord>,
    pub dropped: Vec<DroppedRecord>,
}

pub fn key_of(
    record: &AggregateRecord,
    granularity: Granularity,
) -> Result<CompositeKey, KeyParseFailure> {
    let date = format_date(record.date.ok_or(KeyParseFailure::MissingDate)?);
    match granularity {
        Granularity::Daily => Ok(CompositeKey::daily(date)),
        Granularity::Order => {
            let order = record
                .order_no
                .as_deref()
                .map(str::trim)
                .filter(|order| !order.is_empty());
            match order {
                Some(order) => Ok(CompositeKey::order(date, order)),
                None => Err(KeyParseFailure::MissingOrder { date }),
            }
        }
    }
}

/// Merges partial records sharing a key, in first-seen key order. Later partials win on
/// overlapping metrics. Records without a usable key are dropped and reported.
pub fn merge_records(
    records: impl IntoIterator<Item = AggregateRecord>,
    granularity: Granularity,
) -> MergedRecords {
    let mut merged = MergedRecords::default();
    let mut slots: HashMap<CompositeKey, usize> = HashMap::new();

    for (position, record) in records.into_iter().enumerate() {
        let key = match key_of(&record, granularity) {
            Ok(key) => key,
            Err(failure) => {
                warn!(position, %failure, "dropping record without a usable key");
                merged.dropped.push(DroppedRecord { position, failure });
                continue;
            }
        };
        match slots.get(&key) {
            Some(&slot) => merged.records[slot].record.merge_from(record),
            None => {
                slots.insert(key.clone(), merged.records.len());
                merged.records.push(KeyedRecord { key, record });
            }
        }
    }
    merged
}

/// Folds order-level partial records into one record per date. Partials for the same
/// (date, order) merge last-writer-wins first; distinct orders are then summed per date.
/// Undated records are passed through untouched so they are reported downstream.
pub fn rollup_daily(records: &[AggregateRecord]) -> Vec<AggregateRecord> {
    let mut per_order: Vec<AggregateRecord> = Vec::new();
    let mut slots: HashMap<(NaiveDate, Option<String>), usize> = HashMap::new();
    let mut undated = Vec::new();

    for record in records {
        let Some(date) = record.date else {
            undated.push(record.clone());
            continue;
        };
        let order = record
            .order_no
            .as_deref()
            .map(str::trim)
            .filter(|order| !order.is_empty())
            .map(str::to_string);
        match slots.get(&(date, order.clone())) {
            Some(&slot) => per_order[slot].merge_from(record.clone()),
            None => {
                slots.insert((date, order), per_order.len());
                per_order.push(record.clone());
            }
        }
    }

    let mut by_date: BTreeMap<NaiveDate, AggregateRecord> = BTreeMap::new();
    for partial in per_order {
        let Some(date) = partial.date else { continue };
        let day = by_date
            .entry(date)
            .or_insert_with(|| AggregateRecord::for_date(date));
        for (metric, value) in partial.metrics {
            *day.metrics.entry(metric).or_insert(0.0) += value;
        }
    }

    by_date.into_values().chain(undated).collect()
}

/// Adds an empty (all-zero) record for every day of `[start, end]` that has no record.
pub fn fill_missing_days(records: &mut Vec<AggregateRecord>, start: NaiveDate, end: NaiveDate) {
    let present: BTreeSet<NaiveDate> = records.iter().filter_map(|r| r.date).collect();
    let missing = start
        .iter_days()
        .take_while(|day| *day <= end)
        .filter(|day| !present.contains(day))
        .map(AggregateRecord::for_date)
        .collect::<Vec<_>>();
    records.extend(missing);
}
