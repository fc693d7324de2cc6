use chrono::{DateTime, Utc};
use fieldsync_proto::{Operation, OperationKind};
use serde::Serialize;

/// A durable intent waiting to reach the backend.
///
/// Rows are append-only: once stored, only `retry_count` and `last_error`
/// ever change until the row is applied or discarded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOperation {
    pub id: i64,
    #[serde(flatten)]
    pub operation: Operation,
    pub table_name: String,
    pub record_id: String,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl PendingOperation {
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    /// Has failed at least once; shown as failed in the queue panel
    pub fn has_failed(&self) -> bool {
        self.retry_count > 0
    }

    /// No longer retried automatically
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }
}
