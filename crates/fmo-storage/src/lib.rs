//! Sheet store contract plus the HTTP plumbing (request budget, backoff) shared by the
//! store implementations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fmo_core::{RangeWrite, SheetRequest, SheetSnapshot};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub mod google;
pub mod memory;

pub use google::{GoogleSheetsClient, GoogleWorksheet, SheetsClientConfig};
pub use memory::{MemoryBackend, MemorySheet};

pub const CRATE_NAME: &str = "fmo-storage";

/// Store operation kinds, used for call accounting and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Read,
    WriteRanges,
    InsertRows,
    BatchUpdate,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read-all-values",
            Self::WriteRanges => "batch-write",
            Self::InsertRows => "insert-rows",
            Self::BatchUpdate => "batch-update",
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("worksheet `{0}` not found in spreadsheet")]
    WorksheetNotFound(String),
    #[error("malformed store response: {0}")]
    Decode(String),
    #[error("invalid store request: {0}")]
    Invalid(String),
    #[error("{op} rejected by store")]
    Rejected { op: StoreOp },
}

/// One worksheet of an external tabular store. Rows are 1-based.
#[async_trait]
pub trait SheetStore: Send + Sync {
    fn worksheet(&self) -> &str;

    async fn read_all_values(&self) -> Result<SheetSnapshot, StoreError>;

    /// Writes every block in one call.
    async fn write_ranges(&self, writes: &[RangeWrite]) -> Result<(), StoreError>;

    /// Inserts `rows` so the first lands on `anchor_row`, shifting later rows down.
    async fn insert_rows(
        &self,
        anchor_row: u32,
        rows: &[Vec<String>],
        inherit_format: bool,
    ) -> Result<(), StoreError>;

    async fn batch_update(&self, requests: &[SheetRequest]) -> Result<(), StoreError>;
}

/// Opens worksheet handles; called once per sync cycle.
pub trait SheetBackend: Send + Sync {
    fn open(&self, worksheet: &str) -> Arc<dyn SheetStore>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 429 means the call was refused before doing anything, so it is always safe to repeat.
/// Server errors may have been partially applied and are only repeated for idempotent calls.
pub fn classify_status(status: StatusCode, idempotent: bool) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS || (idempotent && status.is_server_error()) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error, idempotent: bool) -> RetryDisposition {
    if err.is_connect() || (idempotent && err.is_timeout()) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Token bucket bounding how many calls reach the store per time unit.
#[derive(Debug)]
pub struct RequestBudget {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BudgetState>,
}

#[derive(Debug)]
struct BudgetState {
    tokens: u32,
    last_refill: Instant,
}

impl RequestBudget {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(BudgetState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket of `requests` tokens, refilled evenly over one minute.
    pub fn per_minute(requests: u32) -> Self {
        let requests = requests.max(1);
        Self::new(requests, Duration::from_secs(60) / requests)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                if !self.refill_every.is_zero() {
                    let elapsed = state.last_refill.elapsed();
                    let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                    if refills > 0 {
                        state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                        state.last_refill += self.refill_every * refills;
                    }
                } else {
                    state.tokens = self.capacity;
                }

                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.refill_every
                    .saturating_sub(state.last_refill.elapsed())
                    .max(Duration::from_millis(1))
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn rate_limit_is_always_retryable_but_server_errors_only_when_idempotent() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, false),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, true),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, false),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, true),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn budget_hands_out_capacity_without_waiting() {
        let budget = RequestBudget::new(3, Duration::from_secs(3600));
        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            for _ in 0..budget.capacity() {
                budget.acquire().await;
            }
        })
        .await;
        assert!(drained.is_ok());

        let blocked = tokio::time::timeout(Duration::from_millis(50), budget.acquire()).await;
        assert!(blocked.is_err());
    }
}
