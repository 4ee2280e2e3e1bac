//! Aggregate sources: the collaborators that produce per-date / per-order production
//! quantities for a date range.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use fmo_core::AggregateRecord;
use serde::{de::DeserializeOwned, Deserialize};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "fmo-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("database unreachable: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("query for metric `{metric}` failed: {source}")]
    Query {
        metric: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Produces partial aggregate records for `[start, end]` (inclusive). Several records may
/// share a key; merging happens downstream.
#[async_trait]
pub trait AggregateSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_aggregates(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AggregateRecord>, SourceError>;
}

pub const QUERY_REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRegistry {
    pub version: u32,
    pub queries: Vec<MetricQuery>,
}

/// One metric query. It receives the range as `$1`/`$2` and returns the columns
/// `proddate` (date), `orderno` (text, optional) and `qty` (float8).
#[derive(Debug, Clone, Deserialize)]
pub struct MetricQuery {
    pub metric: String,
    pub sql: String,
}

pub fn load_query_registry(path: impl AsRef<Path>) -> anyhow::Result<QueryRegistry> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let registry: QueryRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    anyhow::ensure!(
        registry.version == QUERY_REGISTRY_VERSION,
        "{} has unsupported version {} (expected {QUERY_REGISTRY_VERSION})",
        path.display(),
        registry.version
    );
    anyhow::ensure!(
        !registry.queries.is_empty(),
        "{} declares no metric queries",
        path.display()
    );
    Ok(registry)
}

/// Postgres-backed source; opens a short-lived pool per fetch so that nothing outlives a
/// sync cycle.
#[derive(Debug, Clone)]
pub struct SqlAggregateSource {
    database_url: String,
    queries: Vec<MetricQuery>,
    connect_timeout: Duration,
}

impl SqlAggregateSource {
    pub fn new(database_url: impl Into<String>, registry: QueryRegistry) -> Self {
        Self {
            database_url: database_url.into(),
            queries: registry.queries,
            connect_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl AggregateSource for SqlAggregateSource {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn fetch_aggregates(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AggregateRecord>, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.connect_timeout)
            .connect(&self.database_url)
            .await
            .map_err(SourceError::Connect)?;

        let mut records = Vec::new();
        for query in &self.queries {
            let span = info_span!("metric_query", metric = %query.metric);
            let rows = sqlx::query(&query.sql)
                .bind(start)
                .bind(end)
                .fetch_all(&pool)
                .instrument(span)
                .await
                .map_err(|source| SourceError::Query {
                    metric: query.metric.clone(),
                    source,
                })?;
            debug!(metric = %query.metric, rows = rows.len(), "metric query finished");
            for row in &rows {
                records.push(record_from_row(&query.metric, row)?);
            }
        }
        pool.close().await;

        info!(records = records.len(), %start, %end, "fetched partial aggregates");
        Ok(records)
    }
}

fn record_from_row(metric: &str, row: &PgRow) -> Result<AggregateRecord, SourceError> {
    let query_err = |source| SourceError::Query {
        metric: metric.to_string(),
        source,
    };
    let date: Option<NaiveDate> = row.try_get("proddate").map_err(query_err)?;
    // Daily-only queries have no order column at all.
    let order_no = row
        .try_get::<Option<String>, _>("orderno")
        .ok()
        .flatten()
        .map(|order| order.trim().to_string());
    let qty: Option<f64> = row.try_get("qty").map_err(query_err)?;

    let mut record = AggregateRecord {
        date,
        order_no,
        ..AggregateRecord::default()
    };
    record.metrics.insert(metric.to_string(), qty.unwrap_or(0.0));
    Ok(record)
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureFile {
    records: Vec<AggregateRecord>,
}

/// Serves records from a JSON fixture (or an in-memory list) for offline runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    origin: String,
    records: Vec<AggregateRecord>,
}

impl FixtureSource {
    pub fn from_records(records: Vec<AggregateRecord>) -> Self {
        Self {
            origin: "inline".to_string(),
            records,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file: FixtureFile = read_json_file(path)?;
        Ok(Self {
            origin: path.display().to_string(),
            records: file.records,
        })
    }
}

#[async_trait]
impl AggregateSource for FixtureSource {
    fn name(&self) -> &str {
        &self.origin
    }

    async fn fetch_aggregates(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AggregateRecord>, SourceError> {
        // Undated records pass through so the planner can report them.
        Ok(self
            .records
            .iter()
            .filter(|record| record.date.map_or(true, |date| (start..=end).contains(&date)))
            .cloned()
            .collect())
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Default location of the query registry inside a workspace root.
pub fn query_registry_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join("queries.yaml")
}
