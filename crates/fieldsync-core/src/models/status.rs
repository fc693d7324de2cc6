use chrono::{DateTime, Utc};
use fieldsync_proto::OperationKind;
use serde::Serialize;
use std::collections::BTreeMap;

use super::PendingOperation;

/// Snapshot of queue health for indicators and the queue panel.
///
/// Always derived from the queue contents; never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_count: usize,
    /// Operations with at least one failed attempt
    pub failed_operations: usize,
    /// Operations at the retry ceiling, waiting for user action
    pub exhausted_operations: usize,
    pub pending_by_type: BTreeMap<OperationKind, usize>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl SyncStatus {
    pub fn from_operations(
        operations: &[PendingOperation],
        max_retries: u32,
        is_online: bool,
        is_syncing: bool,
        last_sync_at: Option<DateTime<Utc>>,
    ) -> Self {
        let mut pending_by_type = BTreeMap::new();
        for op in operations {
            *pending_by_type.entry(op.kind()).or_insert(0) += 1;
        }

        Self {
            is_online,
            is_syncing,
            pending_count: operations.len(),
            failed_operations: operations.iter().filter(|op| op.has_failed()).count(),
            exhausted_operations: operations
                .iter()
                .filter(|op| op.is_exhausted(max_retries))
                .count(),
            pending_by_type,
            last_sync_at,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.pending_count == 0 && !self.is_syncing
    }
}
