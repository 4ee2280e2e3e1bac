//! Visibility window and cosmetic formatting, both computed from a post-mutation read.

use chrono::{Days, NaiveDate};
use fmo_core::{
    format_date, parse_date, CellRange, Color, RowSpan, SheetRequest, SheetSnapshot,
    DATA_START_ROW, HEADER_ROW, STAMP_CELL,
};
use serde::{Deserialize, Serialize};

use crate::config::FormatStyle;
use crate::header::ColumnMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum VisibilityMode {
    /// Keep `[today - back_days, today + fwd_days]` visible.
    Rolling { back_days: u32, fwd_days: u32 },
    /// Keep only rows dated today.
    TodayOnly,
}

impl Default for VisibilityMode {
    fn default() -> Self {
        Self::Rolling {
            back_days: 2,
            fwd_days: 5,
        }
    }
}

impl VisibilityMode {
    fn keeps(&self, date_cell: &str, today: NaiveDate, today_text: &str) -> bool {
        match *self {
            Self::TodayOnly => date_cell == today_text,
            Self::Rolling {
                back_days,
                fwd_days,
            } => {
                let Some(date) = parse_date(date_cell) else {
                    return false;
                };
                let first = today
                    .checked_sub_days(Days::new(back_days.into()))
                    .unwrap_or(NaiveDate::MIN);
                let last = today
                    .checked_add_days(Days::new(fwd_days.into()))
                    .unwrap_or(NaiveDate::MAX);
                (first..=last).contains(&date)
            }
        }
    }
}

/// Coalesces row numbers into maximal runs of consecutive rows, ascending.
pub fn group_contiguous(rows: &[u32]) -> Vec<RowSpan> {
    let mut sorted = rows.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: Vec<RowSpan> = Vec::new();
    for row in sorted {
        match runs.last_mut() {
            Some(run) if run.end == row => run.end += 1,
            _ => runs.push(RowSpan::single(row)),
        }
    }
    runs
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VisibilityPlan {
    /// Reset of every data row to visible, applied before `hide`.
    pub show: Option<RowSpan>,
    pub hide: Vec<RowSpan>,
    /// Rows dated today.
    pub highlight: Vec<u32>,
}

impl VisibilityPlan {
    pub fn requests(&self) -> Vec<SheetRequest> {
        let show = self.show.map(|rows| SheetRequest::SetRowsHidden {
            rows,
            hidden: false,
        });
        let hide = self.hide.iter().map(|&rows| SheetRequest::SetRowsHidden {
            rows,
            hidden: true,
        });
        show.into_iter().chain(hide).collect()
    }
}

pub fn window(
    snapshot: &SheetSnapshot,
    map: &ColumnMap,
    today: NaiveDate,
    mode: VisibilityMode,
) -> VisibilityPlan {
    let today_text = format_date(today);
    let mut outside = Vec::new();
    let mut highlight = Vec::new();

    for (row, cells) in snapshot.data_rows() {
        let date_cell = cells.get(map.date_col()).map(String::as_str).unwrap_or("");
        if !mode.keeps(date_cell, today, &today_text) {
            outside.push(row);
        }
        if date_cell == today_text {
            highlight.push(row);
        }
    }

    let last_row = snapshot.row_count();
    VisibilityPlan {
        show: (last_row >= DATA_START_ROW).then(|| RowSpan::through(DATA_START_ROW, last_row)),
        hide: group_contiguous(&outside),
        highlight,
    }
}

/// Text style for the stamp and every row from the header down, a white reset over the
/// data block, then the fill on highlighted rows.
pub fn format_plan(
    snapshot: &SheetSnapshot,
    map: &ColumnMap,
    highlight: &[u32],
    style: FormatStyle,
) -> Vec<SheetRequest> {
    let (stamp_row, stamp_col) = STAMP_CELL;
    let text = |range| SheetRequest::TextStyle {
        range,
        font_size: style.font_size,
        bold: style.bold,
    };

    let mut requests = vec![text(CellRange::columns(
        RowSpan::single(stamp_row),
        stamp_col,
        stamp_col + 1,
    ))];

    let last_row = snapshot.row_count();
    if last_row >= HEADER_ROW {
        requests.push(text(CellRange::whole_rows(RowSpan::through(
            HEADER_ROW, last_row,
        ))));
    }
    if last_row >= DATA_START_ROW {
        requests.push(SheetRequest::Background {
            range: CellRange::columns(RowSpan::through(DATA_START_ROW, last_row), 0, map.width()),
            color: Color::WHITE,
        });
    }
    requests.extend(
        group_contiguous(highlight)
            .into_iter()
            .map(|rows| SheetRequest::Background {
                range: CellRange::columns(rows, 0, map.width()),
                color: Color::TODAY_FILL,
            }),
    );
    requests
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::tests::{layout, snapshot};
    use crate::header::{resolve, HeaderState};
    use fmo_core::Granularity;

    fn map_of(snap: &SheetSnapshot) -> ColumnMap {
        let layout = layout(Granularity::Daily, &[("Date", "date"), ("Qty", "qty_iron")]);
        match resolve(snap, &layout).unwrap() {
            HeaderState::Resolved(map) => map,
            HeaderState::Virgin => panic!("expected a header"),
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sheet_with_dates(dates: &[String]) -> SheetSnapshot {
        let mut rows = vec![vec![], vec!["Date".to_string(), "Qty".to_string()]];
        rows.extend(dates.iter().map(|d| vec![d.clone(), "1".to_string()]));
        SheetSnapshot::new(rows)
    }

    #[test]
    fn contiguous_rows_coalesce_into_maximal_runs() {
        assert!(group_contiguous(&[]).is_empty());
        assert_eq!(
            group_contiguous(&[9, 3, 4, 5, 7, 4]),
            vec![RowSpan::through(3, 5), RowSpan::single(7), RowSpan::single(9)]
        );
    }

    #[test]
    fn runs_cover_input_exactly_and_never_touch() {
        let input = [12u32, 3, 4, 8, 9, 10, 15, 16, 20];
        let runs = group_contiguous(&input);
        let covered: Vec<u32> = runs.iter().flat_map(|r| r.start..r.end).collect();
        let mut expected = input.to_vec();
        expected.sort_unstable();
        assert_eq!(covered, expected);
        assert!(runs.windows(2).all(|pair| pair[0].end < pair[1].start));
    }

    #[test]
    fn rolling_window_hides_old_rows_as_one_range() {
        let today = day(2024, 6, 10);
        let dates: Vec<String> = (-5i64..=5)
            .map(|offset| format_date(today + chrono::Duration::days(offset)))
            .collect();
        let snap = sheet_with_dates(&dates);
        let plan = window(
            &snap,
            &map_of(&snap),
            today,
            VisibilityMode::Rolling {
                back_days: 2,
                fwd_days: 5,
            },
        );

        // Days -5..-3 sit on rows 3..=5.
        assert_eq!(plan.hide, vec![RowSpan::through(3, 5)]);
        assert_eq!(plan.show, Some(RowSpan::through(3, 13)));
        assert_eq!(plan.highlight, vec![8]);
        let requests = plan.requests();
        assert_eq!(requests.len(), 2);
        assert!(matches!(requests[0], SheetRequest::SetRowsHidden { hidden: false, .. }));
    }

    #[test]
    fn unparseable_dates_fall_outside_the_window() {
        let today = day(2024, 6, 10);
        let snap = sheet_with_dates(&["10.06.2024".into(), "soon".into(), "".into(), "11.06.2024".into()]);
        let plan = window(&snap, &map_of(&snap), today, VisibilityMode::default());
        assert_eq!(plan.hide, vec![RowSpan::through(4, 5)]);
    }

    #[test]
    fn today_only_keeps_exact_matches() {
        let today = day(2024, 6, 10);
        let snap = sheet_with_dates(&[
            "09.06.2024".into(),
            "10.06.2024".into(),
            "10.06.2024".into(),
            "11.06.2024".into(),
        ]);
        let plan = window(&snap, &map_of(&snap), today, VisibilityMode::TodayOnly);
        assert_eq!(plan.hide, vec![RowSpan::single(3), RowSpan::single(6)]);
        assert_eq!(plan.highlight, vec![4, 5]);
    }

    #[test]
    fn header_only_sheet_has_nothing_to_show() {
        let snap = sheet_with_dates(&[]);
        let plan = window(&snap, &map_of(&snap), day(2024, 1, 1), VisibilityMode::default());
        assert_eq!(plan, VisibilityPlan::default());
        assert!(plan.requests().is_empty());
    }

    #[test]
    fn format_plan_resets_background_before_filling_today() {
        let snap = sheet_with_dates(&["09.06.2024".into(), "10.06.2024".into()]);
        let requests = format_plan(&snap, &map_of(&snap), &[4], FormatStyle::default());
        assert_eq!(requests.len(), 4);
        assert_eq!(
            requests[0],
            SheetRequest::TextStyle {
                range: CellRange::columns(RowSpan::single(1), 5, 6),
                font_size: 14,
                bold: true
            }
        );
        assert_eq!(
            requests[2],
            SheetRequest::Background {
                range: CellRange::columns(RowSpan::through(3, 4), 0, 2),
                color: Color::WHITE
            }
        );
        assert_eq!(
            requests[3],
            SheetRequest::Background {
                range: CellRange::columns(RowSpan::single(4), 0, 2),
                color: Color::TODAY_FILL
            }
        );
    }

    #[test]
    fn visibility_mode_reads_from_yaml() {
        let rolling: VisibilityMode =
            serde_yaml::from_str("mode: rolling\nback_days: 1\nfwd_days: 3").unwrap();
        assert_eq!(
            rolling,
            VisibilityMode::Rolling {
                back_days: 1,
                fwd_days: 3
            }
        );
        let today: VisibilityMode = serde_yaml::from_str("mode: today_only").unwrap();
        assert_eq!(today, VisibilityMode::TodayOnly);
    }
}
