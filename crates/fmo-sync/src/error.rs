use std::time::Duration;

use fmo_core::LogicalField;
use fmo_source::SourceError;
use fmo_storage::StoreError;
use thiserror::Error;

use crate::executor::Phase;
use crate::key::KeyParseFailure;

/// Failure taxonomy of a sync cycle. Which ones abort what is decided by the caller at each
/// phase boundary: `MissingColumn` aborts one worksheet, `Connectivity` and `Deadline` abort
/// the cycle, `KeyParse` and `ExternalCall` only drop the affected record or mutation group.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("worksheet `{worksheet}`: required column `{column}` ({field}) is missing from header row {row}")]
    MissingColumn {
        worksheet: String,
        column: String,
        field: LogicalField,
        row: u32,
    },
    #[error("cannot key record: {0}")]
    KeyParse(#[from] KeyParseFailure),
    #[error("{phase} call on worksheet `{worksheet}` failed: {source}")]
    ExternalCall {
        phase: Phase,
        worksheet: String,
        #[source]
        source: StoreError,
    },
    #[error("aggregate source unavailable: {0}")]
    Connectivity(#[from] SourceError),
    #[error("sync cycle exceeded its {0:?} deadline")]
    Deadline(Duration),
}
