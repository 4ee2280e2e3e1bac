//! Google Sheets v4 REST store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fmo_core::{CellRange, RangeWrite, SheetRequest, SheetSnapshot};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    classify_reqwest_error, classify_status, BackoffPolicy, RequestBudget, RetryDisposition,
    SheetBackend, SheetStore, StoreError,
};

pub const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com/v4";

#[derive(Debug, Clone)]
pub struct SheetsClientConfig {
    pub spreadsheet_id: String,
    pub access_token: String,
    pub base_url: String,
    pub timeout: Duration,
    pub requests_per_minute: u32,
    pub backoff: BackoffPolicy,
}

impl SheetsClientConfig {
    pub fn new(spreadsheet_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            access_token: access_token.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(20),
            requests_per_minute: 60,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Cheap to clone; clones share the HTTP connection pool and the request budget.
#[derive(Debug, Clone)]
pub struct GoogleSheetsClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    http: reqwest::Client,
    base_url: Url,
    spreadsheet_id: String,
    access_token: String,
    budget: RequestBudget,
    backoff: BackoffPolicy,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

impl GoogleSheetsClient {
    pub fn new(config: SheetsClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("parsing sheets base url {}", config.base_url))?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                base_url,
                spreadsheet_id: config.spreadsheet_id,
                access_token: config.access_token,
                budget: RequestBudget::per_minute(config.requests_per_minute),
                backoff: config.backoff,
            }),
        })
    }

    pub fn worksheet(&self, title: impl Into<String>) -> GoogleWorksheet {
        GoogleWorksheet {
            client: self.clone(),
            title: title.into(),
            sheet_id: OnceCell::new(),
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.inner.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Invalid(format!("base url {} cannot hold a path", self.inner.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        idempotent: bool,
    ) -> Result<Value, StoreError> {
        let backoff = self.inner.backoff;
        let mut attempt = 0usize;
        loop {
            self.inner.budget.acquire().await;

            let mut request = self
                .inner
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(&self.inner.access_token);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json::<Value>().await?);
                    }

                    if classify_status(status, idempotent) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(%status, attempt, "sheets call throttled or failed; backing off");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err, idempotent) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(error = %err, attempt, "sheets call did not complete; backing off");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }
    }

    async fn lookup_sheet_id(&self, title: &str) -> Result<i64, StoreError> {
        let mut url = self.url(&["spreadsheets", &self.inner.spreadsheet_id])?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties(sheetId,title)");
        let value = self.send(Method::GET, url, None, true).await?;
        let meta: SpreadsheetMeta =
            serde_json::from_value(value).map_err(|err| StoreError::Decode(err.to_string()))?;
        meta.sheets
            .into_iter()
            .find(|entry| entry.properties.title == title)
            .map(|entry| entry.properties.sheet_id)
            .ok_or_else(|| StoreError::WorksheetNotFound(title.to_string()))
    }

    async fn values_batch_update(
        &self,
        title: &str,
        writes: &[RangeWrite],
    ) -> Result<(), StoreError> {
        let data = writes
            .iter()
            .map(|write| {
                json!({
                    "range": format!("{}!{}", quote_title(title), write.a1()),
                    "values": write.values,
                })
            })
            .collect::<Vec<_>>();
        let body = json!({ "valueInputOption": "USER_ENTERED", "data": data });
        let url = self.url(&[
            "spreadsheets",
            &self.inner.spreadsheet_id,
            "values:batchUpdate",
        ])?;
        self.send(Method::POST, url, Some(&body), true).await?;
        Ok(())
    }

    async fn spreadsheet_batch_update(
        &self,
        requests: Vec<Value>,
        idempotent: bool,
    ) -> Result<(), StoreError> {
        let body = json!({ "requests": requests });
        let segment = format!("{}:batchUpdate", self.inner.spreadsheet_id);
        let url = self.url(&["spreadsheets", &segment])?;
        self.send(Method::POST, url, Some(&body), idempotent).await?;
        Ok(())
    }
}

impl SheetBackend for GoogleSheetsClient {
    fn open(&self, worksheet: &str) -> Arc<dyn SheetStore> {
        Arc::new(self.worksheet(worksheet))
    }
}

/// Handle on one worksheet; resolves the numeric sheet id lazily, once per handle.
#[derive(Debug)]
pub struct GoogleWorksheet {
    client: GoogleSheetsClient,
    title: String,
    sheet_id: OnceCell<i64>,
}

impl GoogleWorksheet {
    async fn sheet_id(&self) -> Result<i64, StoreError> {
        self.sheet_id
            .get_or_try_init(|| self.client.lookup_sheet_id(&self.title))
            .await
            .copied()
    }
}

#[async_trait]
impl SheetStore for GoogleWorksheet {
    fn worksheet(&self) -> &str {
        &self.title
    }

    async fn read_all_values(&self) -> Result<SheetSnapshot, StoreError> {
        let span = info_span!("sheets_read", worksheet = %self.title);
        async {
            let range = quote_title(&self.title);
            let mut url = self.client.url(&[
                "spreadsheets",
                &self.client.inner.spreadsheet_id,
                "values",
                &range,
            ])?;
            url.query_pairs_mut()
                .append_pair("majorDimension", "ROWS")
                .append_pair("valueRenderOption", "FORMATTED_VALUE");
            let value = self.client.send(Method::GET, url, None, true).await?;
            let range: ValueRange =
                serde_json::from_value(value).map_err(|err| StoreError::Decode(err.to_string()))?;
            let rows = range
                .values
                .into_iter()
                .map(|row| row.into_iter().map(cell_text).collect())
                .collect::<Vec<Vec<String>>>();
            debug!(rows = rows.len(), "read worksheet values");
            Ok::<_, StoreError>(SheetSnapshot::new(rows))
        }
        .instrument(span)
        .await
    }

    async fn write_ranges(&self, writes: &[RangeWrite]) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        self.client.values_batch_update(&self.title, writes).await
    }

    async fn insert_rows(
        &self,
        anchor_row: u32,
        rows: &[Vec<String>],
        inherit_format: bool,
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        if anchor_row == 0 {
            return Err(StoreError::Invalid("rows are 1-based".to_string()));
        }
        let sheet_id = self.sheet_id().await?;
        let start = anchor_row - 1;
        let insert = json!({
            "insertDimension": {
                "range": {
                    "sheetId": sheet_id,
                    "dimension": "ROWS",
                    "startIndex": start,
                    "endIndex": start + rows.len() as u32,
                },
                "inheritFromBefore": inherit_format && start > 0,
            }
        });
        self.client.spreadsheet_batch_update(vec![insert], false).await?;

        let block = RangeWrite {
            row: anchor_row,
            col: 0,
            values: rows.to_vec(),
        };
        self.client
            .values_batch_update(&self.title, std::slice::from_ref(&block))
            .await
    }

    async fn batch_update(&self, requests: &[SheetRequest]) -> Result<(), StoreError> {
        if requests.is_empty() {
            return Ok(());
        }
        let sheet_id = self.sheet_id().await?;
        let payload = requests
            .iter()
            .map(|request| request_json(sheet_id, request))
            .collect();
        self.client.spreadsheet_batch_update(payload, true).await
    }
}

/// Sheet titles are quoted in A1 ranges; embedded quotes are doubled.
pub fn quote_title(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

fn cell_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn grid_range(sheet_id: i64, range: &CellRange) -> Value {
    let mut grid = json!({
        "sheetId": sheet_id,
        "startRowIndex": range.rows.start.saturating_sub(1),
        "endRowIndex": range.rows.end.saturating_sub(1),
    });
    if let Some((start, end)) = range.columns {
        grid["startColumnIndex"] = json!(start);
        grid["endColumnIndex"] = json!(end);
    }
    grid
}

/// Sheets API request body for one structural request; row spans become 0-based.
pub fn request_json(sheet_id: i64, request: &SheetRequest) -> Value {
    match request {
        SheetRequest::SetRowsHidden { rows, hidden } => json!({
            "updateDimensionProperties": {
                "range": {
                    "sheetId": sheet_id,
                    "dimension": "ROWS",
                    "startIndex": rows.start.saturating_sub(1),
                    "endIndex": rows.end.saturating_sub(1),
                },
                "properties": { "hiddenByUser": hidden },
                "fields": "hiddenByUser",
            }
        }),
        SheetRequest::TextStyle {
            range,
            font_size,
            bold,
        } => json!({
            "repeatCell": {
                "range": grid_range(sheet_id, range),
                "cell": {
                    "userEnteredFormat": {
                        "textFormat": { "fontSize": font_size, "bold": bold }
                    }
                },
                "fields": "userEnteredFormat.textFormat.fontSize,userEnteredFormat.textFormat.bold",
            }
        }),
        SheetRequest::Background { range, color } => json!({
            "repeatCell": {
                "range": grid_range(sheet_id, range),
                "cell": {
                    "userEnteredFormat": { "backgroundColor": color }
                },
                "fields": "userEnteredFormat.backgroundColor",
            }
        }),
    }
}
