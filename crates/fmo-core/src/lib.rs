//! Core domain model for the FMO sheet sync: aggregate records, composite keys and the
//! tabular sheet vocabulary shared by the stores and the reconciliation engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub mod sheet;

pub use sheet::{
    a1_cell, a1_range, column_letter, CellRange, Color, RangeWrite, RowSpan, SheetRequest,
    SheetSnapshot, DATA_START_ROW, HEADER_ROW, STAMP_CELL,
};

pub const CRATE_NAME: &str = "fmo-core";

/// Date format of the key columns. Keys are compared as strings against the sheet, so
/// this format is part of the on-sheet contract.
pub const DATE_FORMAT: &str = "%d.%m.%Y";

/// Format of the "last updated" stamp written to row 1.
pub const STAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

/// Renders a quantity the way a person would type it: integral values lose the `.0`.
pub fn format_quantity(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Row identity granularity of a worksheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One row per production date.
    Daily,
    /// One row per (production date, order number).
    Order,
}

/// Logical column a header cell can be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogicalField {
    Date,
    Order,
    Metric(String),
}

impl From<String> for LogicalField {
    fn from(value: String) -> Self {
        match value.trim() {
            "date" => Self::Date,
            "order" => Self::Order,
            other => Self::Metric(other.to_string()),
        }
    }
}

impl From<LogicalField> for String {
    fn from(value: LogicalField) -> Self {
        match value {
            LogicalField::Date => "date".to_string(),
            LogicalField::Order => "order".to_string(),
            LogicalField::Metric(name) => name,
        }
    }
}

impl fmt::Display for LogicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Date => f.write_str("date"),
            Self::Order => f.write_str("order"),
            Self::Metric(name) => f.write_str(name),
        }
    }
}

/// One (possibly partial) aggregate row produced by the source queries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub order_no: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl AggregateRecord {
    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            ..Self::default()
        }
    }

    pub fn for_order(date: NaiveDate, order_no: impl Into<String>) -> Self {
        Self {
            date: Some(date),
            order_no: Some(order_no.into()),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Absent metrics read as zero.
    pub fn metric(&self, name: &str) -> f64 {
        self.metrics.get(name).copied().unwrap_or(0.0)
    }

    /// Field-wise last-writer-wins merge of a later partial record into this one.
    pub fn merge_from(&mut self, later: AggregateRecord) {
        if later.date.is_some() {
            self.date = later.date;
        }
        if later.order_no.is_some() {
            self.order_no = later.order_no;
        }
        self.metrics.extend(later.metrics);
    }
}

/// Normalized identity of a record or an existing sheet row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CompositeKey {
    pub date: String,
    pub order: Option<String>,
}

impl CompositeKey {
    pub fn daily(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            order: None,
        }
    }

    pub fn order(date: impl Into<String>, order: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            order: Some(order.into()),
        }
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.order {
            Some(order) => write!(f, "{}/{}", self.date, order),
            None => f.write_str(&self.date),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn dates_are_zero_padded_day_first() {
        assert_eq!(format_date(day(2024, 3, 1)), "01.03.2024");
        assert_eq!(parse_date("01.03.2024"), Some(day(2024, 3, 1)));
        assert_eq!(parse_date("2024-03-01"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn quantities_drop_integral_fraction() {
        assert_eq!(format_quantity(12.0), "12");
        assert_eq!(format_quantity(0.0), "0");
        assert_eq!(format_quantity(2.5), "2.5");
        assert_eq!(format_quantity(-3.0), "-3");
    }

    #[test]
    fn merge_unions_and_overwrites_metrics() {
        let mut a = AggregateRecord::for_order(day(2024, 3, 1), "42")
            .with_metric("qty_izd_pvh", 3.0)
            .with_metric("qty_mosnet", 1.0);
        let b = AggregateRecord::for_order(day(2024, 3, 1), "42")
            .with_metric("qty_mosnet", 7.0)
            .with_metric("qty_iron", 2.0);
        a.merge_from(b);

        assert_eq!(a.metric("qty_izd_pvh"), 3.0);
        assert_eq!(a.metric("qty_mosnet"), 7.0);
        assert_eq!(a.metric("qty_iron"), 2.0);
        assert_eq!(a.metric("qty_sandwiches"), 0.0);
    }

    #[test]
    fn logical_fields_round_trip_through_config_names() {
        let parsed: Vec<LogicalField> =
            serde_json::from_str(r#"["date", "order", "qty_razdv"]"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                LogicalField::Date,
                LogicalField::Order,
                LogicalField::Metric("qty_razdv".into())
            ]
        );
        assert_eq!(LogicalField::Metric("qty_razdv".into()).to_string(), "qty_razdv");
    }
}
