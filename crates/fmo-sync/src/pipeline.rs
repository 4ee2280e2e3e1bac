//! One sync cycle end to end, plus the scheduling and wiring around it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, Local, NaiveDate, NaiveDateTime, Utc};
use fmo_core::{column_letter, AggregateRecord, Granularity, STAMP_FORMAT};
use fmo_source::{load_query_registry, AggregateSource, FixtureSource, SqlAggregateSource};
use fmo_storage::{GoogleSheetsClient, SheetBackend, SheetStore, SheetsClientConfig, StoreError};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{load_sheet_registry, SheetLayout, SyncConfig};
use crate::error::SyncError;
use crate::executor::{ApplyReport, Phase, PhaseFailure, SyncExecutor};
use crate::header::{resolve, ColumnMap, HeaderState};
use crate::index::SheetIndex;
use crate::key::{fill_missing_days, rollup_daily};
use crate::plan::{plan, plan_virgin, MutationPlan};
use crate::window::{format_plan, window};

/// Everything a cycle needs to know about "now"; built fresh for every run.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub run_id: Uuid,
    pub today: NaiveDate,
    pub now: NaiveDateTime,
    pub fetch_start: NaiveDate,
    pub fetch_end: NaiveDate,
    pub max_batch: usize,
}

impl SyncContext {
    pub fn new(now: NaiveDateTime, back_days: u32, fwd_days: u32, max_batch: usize) -> Self {
        let today = now.date();
        Self {
            run_id: Uuid::new_v4(),
            today,
            now,
            fetch_start: today
                .checked_sub_days(Days::new(back_days.into()))
                .unwrap_or(today),
            fetch_end: today
                .checked_add_days(Days::new(fwd_days.into()))
                .unwrap_or(today),
            max_batch,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            Local::now().naive_local(),
            config.fetch_back_days,
            config.fetch_fwd_days,
            config.max_batch,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetStatus {
    Synced,
    /// Data landed but some cosmetic phase failed.
    Degraded,
    /// Some data mutations were skipped; the next cycle re-diffs them.
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetOutcome {
    pub worksheet: String,
    pub status: SheetStatus,
    pub virgin: bool,
    pub updates: usize,
    pub inserts: usize,
    pub unchanged: usize,
    pub dropped_records: usize,
    pub duplicate_keys: usize,
    pub hidden_ranges: usize,
    pub report: ApplyReport,
    pub error: Option<String>,
}

impl SheetOutcome {
    fn new(worksheet: &str) -> Self {
        Self {
            worksheet: worksheet.to_string(),
            status: SheetStatus::Synced,
            virgin: false,
            updates: 0,
            inserts: 0,
            unchanged: 0,
            dropped_records: 0,
            duplicate_keys: 0,
            hidden_ranges: 0,
            report: ApplyReport::default(),
            error: None,
        }
    }

    fn failed(mut self, err: SyncError) -> Self {
        warn!(worksheet = %self.worksheet, error = %err, "worksheet sync aborted");
        self.status = SheetStatus::Failed;
        self.error = Some(err.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    /// The source returned nothing; the sheets were left alone.
    SkippedEmpty,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetch_start: NaiveDate,
    pub fetch_end: NaiveDate,
    pub fetched_records: usize,
    pub status: CycleStatus,
    pub sheets: Vec<SheetOutcome>,
}

/// Header diagnostics for one worksheet.
#[derive(Debug, Clone, Serialize)]
pub struct HeaderReport {
    pub worksheet: String,
    pub virgin: bool,
    /// `(column letter, header title, logical field)` for every bound column.
    pub columns: Vec<(String, String, String)>,
    pub missing: Vec<String>,
    pub error: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    layouts: Vec<SheetLayout>,
    source: Arc<dyn AggregateSource>,
    backend: Arc<dyn SheetBackend>,
    busy: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        layouts: Vec<SheetLayout>,
        source: Arc<dyn AggregateSource>,
        backend: Arc<dyn SheetBackend>,
    ) -> Self {
        Self {
            config,
            layouts,
            source,
            backend,
            busy: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn layouts(&self) -> &[SheetLayout] {
        &self.layouts
    }

    pub async fn run_cycle(&self, ctx: &SyncContext) -> Result<CycleSummary, SyncError> {
        let span = info_span!("sync_cycle", run_id = %ctx.run_id, today = %ctx.today);
        self.run_cycle_inner(ctx).instrument(span).await
    }

    async fn run_cycle_inner(&self, ctx: &SyncContext) -> Result<CycleSummary, SyncError> {
        let started_at = Utc::now();
        let records = self
            .source
            .fetch_aggregates(ctx.fetch_start, ctx.fetch_end)
            .await?;
        info!(
            source = self.source.name(),
            records = records.len(),
            start = %ctx.fetch_start,
            end = %ctx.fetch_end,
            "aggregates fetched"
        );

        let mut summary = CycleSummary {
            run_id: ctx.run_id,
            started_at,
            finished_at: started_at,
            fetch_start: ctx.fetch_start,
            fetch_end: ctx.fetch_end,
            fetched_records: records.len(),
            status: CycleStatus::Completed,
            sheets: Vec::new(),
        };

        if records.is_empty() {
            warn!("source returned no records; skipping this cycle");
            summary.status = CycleStatus::SkippedEmpty;
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        for layout in &self.layouts {
            let span = info_span!("sheet", worksheet = %layout.worksheet);
            let outcome = self.sync_sheet(ctx, layout, &records).instrument(span).await;
            summary.sheets.push(outcome);
        }
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    async fn sync_sheet(
        &self,
        ctx: &SyncContext,
        layout: &SheetLayout,
        records: &[AggregateRecord],
    ) -> SheetOutcome {
        let mut outcome = SheetOutcome::new(&layout.worksheet);
        let store = self.backend.open(&layout.worksheet);
        let records = records_for_layout(layout, records, ctx);

        let snapshot = match store.read_all_values().await {
            Ok(snapshot) => snapshot,
            Err(err) => return outcome.failed(read_failure(store.as_ref(), err)),
        };

        let mutations = match resolve(&snapshot, layout) {
            Err(err) => return outcome.failed(err),
            Ok(HeaderState::Virgin) => {
                outcome.virgin = true;
                match plan_virgin(&records, layout) {
                    Ok(mutations) => mutations,
                    Err(err) => return outcome.failed(err),
                }
            }
            Ok(HeaderState::Resolved(map)) => {
                let index = SheetIndex::build(&snapshot, &map);
                outcome.duplicate_keys = index.duplicates().len();
                plan(&records, &index, &map)
            }
        };
        record_plan(&mut outcome, &mutations);

        // A blank sheet with nothing to write must stay blank, or it loses its header slot.
        if outcome.virgin && mutations.is_noop() {
            info!(
                dropped = outcome.dropped_records,
                "blank worksheet and no rows; left untouched"
            );
            return outcome;
        }

        let executor = SyncExecutor::new(store.as_ref(), ctx.max_batch);
        outcome.report.absorb(executor.apply(&mutations).await);
        let stamp = format!("{} {}", layout.stamp_label, ctx.now.format(STAMP_FORMAT));
        outcome.report.absorb(executor.stamp(stamp).await);

        // Visibility and formatting work on what actually landed.
        match store.read_all_values().await {
            Ok(current) => match resolve(&current, layout) {
                Ok(HeaderState::Resolved(map)) => {
                    let visibility = window(&current, &map, ctx.today, layout.visibility);
                    outcome.hidden_ranges = visibility.hide.len();
                    outcome.report.absorb(
                        executor
                            .apply_requests(Phase::Visibility, &visibility.requests())
                            .await,
                    );
                    let highlight: &[u32] = if layout.highlight_today {
                        visibility.highlight.as_slice()
                    } else {
                        &[]
                    };
                    let formats = format_plan(&current, &map, highlight, layout.style);
                    outcome
                        .report
                        .absorb(executor.apply_requests(Phase::Format, &formats).await);
                }
                Ok(HeaderState::Virgin) => {}
                Err(err) => warn!(error = %err, "header vanished after write; skipping cosmetics"),
            },
            Err(err) => {
                let err = SyncError::ExternalCall {
                    phase: Phase::Visibility,
                    worksheet: layout.worksheet.clone(),
                    source: err,
                };
                warn!(error = %err, "post-write read failed; skipping cosmetics");
                outcome.report.failures.push(PhaseFailure {
                    phase: Phase::Visibility,
                    message: err.to_string(),
                });
            }
        }

        outcome.status = if outcome.report.data_failed() {
            SheetStatus::Partial
        } else if outcome.report.failures.is_empty() {
            SheetStatus::Synced
        } else {
            SheetStatus::Degraded
        };
        info!(
            status = ?outcome.status,
            updates = outcome.updates,
            inserts = outcome.inserts,
            unchanged = outcome.unchanged,
            dropped = outcome.dropped_records,
            duplicates = outcome.duplicate_keys,
            "worksheet synced"
        );
        outcome
    }

    /// One cycle under the configured deadline.
    pub async fn run_once(&self) -> Result<CycleSummary, SyncError> {
        let ctx = SyncContext::from_config(&self.config);
        let deadline = Duration::from_secs(self.config.cycle_deadline_secs);
        tokio::time::timeout(deadline, self.run_cycle(&ctx))
            .await
            .map_err(|_| SyncError::Deadline(deadline))?
    }

    /// Like [`run_once`](Self::run_once) but returns `None` without doing anything when a
    /// cycle is already in flight.
    pub async fn run_guarded(&self) -> Option<Result<CycleSummary, SyncError>> {
        let Ok(_guard) = self.busy.try_lock() else {
            warn!("previous sync cycle still running; skipping this tick");
            return None;
        };
        Some(self.run_once().await)
    }

    pub async fn run_logged(&self) {
        match self.run_guarded().await {
            Some(Ok(summary)) => info!(
                run_id = %summary.run_id,
                status = ?summary.status,
                sheets = summary.sheets.len(),
                "sync cycle finished"
            ),
            Some(Err(err)) => error!(error = %err, "sync cycle aborted"),
            None => {}
        }
    }

    /// Reads every configured worksheet and reports how its header resolves.
    pub async fn check_headers(&self) -> Vec<HeaderReport> {
        let mut reports = Vec::with_capacity(self.layouts.len());
        for layout in &self.layouts {
            let store = self.backend.open(&layout.worksheet);
            let mut report = HeaderReport {
                worksheet: layout.worksheet.clone(),
                virgin: false,
                columns: Vec::new(),
                missing: Vec::new(),
                error: None,
            };
            let snapshot = match store.read_all_values().await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    report.error = Some(read_failure(store.as_ref(), err).to_string());
                    reports.push(report);
                    continue;
                }
            };
            match resolve(&snapshot, layout) {
                Ok(HeaderState::Virgin) => report.virgin = true,
                Ok(HeaderState::Resolved(map)) => describe_columns(&mut report, layout, &map),
                Err(err) => report.error = Some(err.to_string()),
            }
            reports.push(report);
        }
        reports
    }
}

fn read_failure(store: &dyn SheetStore, source: StoreError) -> SyncError {
    SyncError::ExternalCall {
        phase: Phase::Read,
        worksheet: store.worksheet().to_string(),
        source,
    }
}

fn record_plan(outcome: &mut SheetOutcome, plan: &MutationPlan) {
    outcome.updates = plan.updates.len();
    outcome.inserts = plan.inserts.len();
    outcome.unchanged = plan.unchanged;
    outcome.dropped_records = plan.dropped.len();
}

fn describe_columns(report: &mut HeaderReport, layout: &SheetLayout, map: &ColumnMap) {
    for col in 0..map.width() {
        if let Some(field) = map.binding(col) {
            report.columns.push((
                column_letter(col),
                map.header()[col].trim().to_string(),
                field.to_string(),
            ));
        }
    }
    report.missing = layout
        .columns
        .iter()
        .filter(|c| map.column_of(&c.field).is_none())
        .map(|c| c.title.clone())
        .collect();
}

/// Daily sheets take per-date sums of the order-level partials, optionally padded with
/// zero rows for quiet days; order sheets take the partials as they are.
pub fn records_for_layout(
    layout: &SheetLayout,
    records: &[AggregateRecord],
    ctx: &SyncContext,
) -> Vec<AggregateRecord> {
    match layout.granularity {
        Granularity::Order => records.to_vec(),
        Granularity::Daily => {
            let mut daily = rollup_daily(records);
            if layout.fill_missing_days {
                fill_missing_days(&mut daily, ctx.fetch_start, ctx.fetch_end);
            }
            daily
        }
    }
}

/// Repeats `run_logged` every `sync_interval_secs`. The caller owns the first run and
/// starting the scheduler.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let every = Duration::from_secs(pipeline.config().sync_interval_secs.max(1));
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(every, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            pipeline.run_logged().await;
        })
    })
    .with_context(|| format!("creating repeated sync job every {every:?}"))?;
    sched.add(job).await.context("adding sync job")?;
    Ok(sched)
}

/// Wires the production pipeline: `sheets.yaml` layouts, the Postgres source (or a JSON
/// fixture when `FMO_FIXTURE_PATH` is set) and the Google Sheets store.
pub fn pipeline_from_env(config: SyncConfig) -> Result<SyncPipeline> {
    let registry = load_sheet_registry(config.sheets_registry_path())?;

    let source: Arc<dyn AggregateSource> = match &config.fixture_path {
        Some(path) => Arc::new(FixtureSource::load(path)?),
        None => {
            let queries = load_query_registry(config.queries_registry_path())?;
            Arc::new(
                SqlAggregateSource::new(config.database_url.clone(), queries)
                    .with_connect_timeout(Duration::from_secs(config.http_timeout_secs)),
            )
        }
    };

    anyhow::ensure!(
        !config.spreadsheet_id.trim().is_empty(),
        "FMO_SPREADSHEET_ID is not set"
    );
    let mut sheets = SheetsClientConfig::new(&config.spreadsheet_id, &config.access_token);
    sheets.timeout = Duration::from_secs(config.http_timeout_secs);
    sheets.requests_per_minute = config.sheets_requests_per_minute;
    let backend: Arc<dyn SheetBackend> = Arc::new(GoogleSheetsClient::new(sheets)?);

    let layouts: Vec<SheetLayout> = registry.enabled().cloned().collect();
    anyhow::ensure!(!layouts.is_empty(), "no enabled worksheet in sheets.yaml");
    Ok(SyncPipeline::new(config, layouts, source, backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::tests::layout;
    use chrono::NaiveTime;

    fn ctx_at(y: i32, m: u32, d: u32) -> SyncContext {
        let now = NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        SyncContext::new(now, 2, 3, 500)
    }

    #[test]
    fn context_spans_the_fetch_range() {
        let ctx = ctx_at(2024, 3, 1);
        assert_eq!(ctx.today, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(ctx.fetch_start, NaiveDate::from_ymd_opt(2024, 2, 28).unwrap());
        assert_eq!(ctx.fetch_end, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        assert_ne!(ctx.run_id, ctx_at(2024, 3, 1).run_id);
    }

    #[test]
    fn daily_layouts_roll_up_and_pad_the_range() {
        let ctx = ctx_at(2024, 3, 1);
        let mut daily = layout(Granularity::Daily, &[("Date", "date"), ("Qty", "q")]);
        daily.fill_missing_days = true;
        let records = vec![
            AggregateRecord::for_order(ctx.today, "1").with_metric("q", 2.0),
            AggregateRecord::for_order(ctx.today, "2").with_metric("q", 3.0),
        ];

        let rows = records_for_layout(&daily, &records, &ctx);
        assert_eq!(rows.len(), 6);
        let today = rows.iter().find(|r| r.date == Some(ctx.today)).unwrap();
        assert_eq!(today.metric("q"), 5.0);

        let orders = layout(Granularity::Order, &[("Date", "date"), ("Order", "order")]);
        assert_eq!(records_for_layout(&orders, &records, &ctx), records);
    }
}
