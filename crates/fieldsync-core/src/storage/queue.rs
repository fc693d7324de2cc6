//! Operation Queue: FIFO of pending mutations keyed by a monotonically
//! increasing local id.

use anyhow::{Context, Result};
use chrono::Utc;
use fieldsync_proto::{Operation, PhotoDeletion};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use super::{format_timestamp, parse_timestamp, LocalStore};
use crate::models::PendingOperation;

const OPERATION_COLUMNS: &str =
    "id, table_name, record_id, data, created_at, retry_count, last_error";

struct OperationRow {
    id: i64,
    table_name: String,
    record_id: String,
    data: String,
    created_at: String,
    retry_count: i64,
    last_error: Option<String>,
}

impl OperationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            table_name: row.get(1)?,
            record_id: row.get(2)?,
            data: row.get(3)?,
            created_at: row.get(4)?,
            retry_count: row.get(5)?,
            last_error: row.get(6)?,
        })
    }

    fn into_operation(self) -> Result<PendingOperation> {
        let operation: Operation = serde_json::from_str(&self.data)
            .with_context(|| format!("Corrupt payload for queued operation {}", self.id))?;
        Ok(PendingOperation {
            id: self.id,
            operation,
            table_name: self.table_name,
            record_id: self.record_id,
            timestamp: parse_timestamp(&self.created_at)?,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            last_error: self.last_error,
        })
    }
}

impl LocalStore {
    /// Persist a new operation and return its id
    pub fn enqueue(&self, operation: &Operation, table_name: &str, record_id: &str) -> Result<i64> {
        let data = serde_json::to_string(operation).context("Failed to serialize operation")?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pending_operations (operation_type, table_name, record_id, data, created_at, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                operation.kind().as_str(),
                table_name,
                record_id,
                data,
                format_timestamp(&Utc::now())
            ],
        )
        .context("Failed to persist queued operation")?;
        let id = conn.last_insert_rowid();
        debug!(id, kind = %operation.kind(), table_name, record_id, "queued operation");
        Ok(id)
    }

    /// All queued operations, oldest first
    pub fn list_operations(&self) -> Result<Vec<PendingOperation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_operations ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([], OperationRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_operation()?);
        }
        Ok(out)
    }

    pub fn get_operation(&self, id: i64) -> Result<Option<PendingOperation>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {OPERATION_COLUMNS} FROM pending_operations WHERE id = ?1"),
                params![id],
                OperationRow::from_row,
            )
            .optional()?;
        row.map(OperationRow::into_operation).transpose()
    }

    /// Remove an operation unconditionally. Returns false if it was not queued.
    pub fn delete_operation(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM pending_operations WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    /// Oldest queued operation
    pub fn peek_next(&self) -> Result<Option<PendingOperation>> {
        self.next_after(0, None)
    }

    /// Oldest operation with an id above `cursor`, skipping those whose
    /// retry count reached `ceiling`
    pub fn next_after(&self, cursor: i64, ceiling: Option<u32>) -> Result<Option<PendingOperation>> {
        let ceiling = ceiling.map(i64::from).unwrap_or(i64::MAX);
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {OPERATION_COLUMNS} FROM pending_operations
                     WHERE id > ?1 AND retry_count < ?2
                     ORDER BY id ASC LIMIT 1"
                ),
                params![cursor, ceiling],
                OperationRow::from_row,
            )
            .optional()?;
        row.map(OperationRow::into_operation).transpose()
    }

    /// Count one failed attempt. Returns the new retry count.
    pub fn record_failure(&self, id: i64, error: &str) -> Result<u32> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE pending_operations SET retry_count = retry_count + 1, last_error = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        retry_count(&conn, id)
    }

    /// Count a failure that will never succeed on retry: the retry count
    /// jumps straight to the ceiling
    pub fn mark_exhausted(&self, id: i64, ceiling: u32, error: &str) -> Result<u32> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE pending_operations SET retry_count = MAX(retry_count + 1, ?2), last_error = ?3 WHERE id = ?1",
            params![id, i64::from(ceiling), error],
        )?;
        retry_count(&conn, id)
    }

    /// Remove every operation that has failed at least once and return them
    pub fn take_failed_operations(&self) -> Result<Vec<PendingOperation>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let failed = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {OPERATION_COLUMNS} FROM pending_operations WHERE retry_count > 0 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map([], OperationRow::from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?.into_operation()?);
            }
            out
        };
        tx.execute("DELETE FROM pending_operations WHERE retry_count > 0", [])?;
        tx.commit()?;
        Ok(failed)
    }

    /// Remove an operation at the user's request and undo its local
    /// bookkeeping. Returns the removed operation.
    pub fn discard_operation(&self, id: i64) -> Result<Option<PendingOperation>> {
        let Some(op) = self.get_operation(id)? else {
            return Ok(None);
        };
        if !self.delete_operation(id)? {
            return Ok(None);
        }
        self.release_local_state(&op)?;
        Ok(Some(op))
    }

    /// Discard every failed operation. Returns how many were removed.
    pub fn clear_failed_operations(&self) -> Result<usize> {
        let failed = self.take_failed_operations()?;
        for op in &failed {
            self.release_local_state(op)?;
        }
        Ok(failed.len())
    }

    // An upload that will never run must not leave its blob behind, and a
    // photo whose delete was discarded shows up again.
    fn release_local_state(&self, op: &PendingOperation) -> Result<()> {
        match &op.operation {
            Operation::UploadPhoto(upload) => {
                if let Some(photo) = self.get_photo(upload.local_photo_id)? {
                    if !photo.uploaded {
                        self.purge_photo(photo.id)?;
                        debug!(photo_id = photo.id, "purged photo of discarded upload");
                    }
                }
            }
            Operation::DeletePhoto(PhotoDeletion {
                local_photo_id: Some(photo_id),
                ..
            }) => {
                self.set_photo_marked_for_deletion(*photo_id, false)?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn count_operations(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM pending_operations", [], |row| {
            row.get(0)
        })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn retry_count(conn: &rusqlite::Connection, id: i64) -> Result<u32> {
    let count: Option<i64> = conn
        .query_row(
            "SELECT retry_count FROM pending_operations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(count.and_then(|c| u32::try_from(c).ok()).unwrap_or(0))
}
