use anyhow::{Context, Result};
use rusqlite::params;
use serde_json::{Map, Value};
use tracing::warn;

use super::LocalStore;

pub type Record = Map<String, Value>;

/// String form of a row's `id` column, if it has one
pub fn record_id(record: &Record) -> Option<String> {
    match record.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl LocalStore {
    /// Replace the cached copy of a remote table with freshly fetched rows
    pub fn replace_snapshot(&self, table_name: &str, rows: &[Record]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM snapshots WHERE table_name = ?1", params![table_name])?;
        for (position, row) in rows.iter().enumerate() {
            let Some(id) = record_id(row) else {
                warn!(table_name, "skipping snapshot row without an id");
                continue;
            };
            let data = serde_json::to_string(row).context("Failed to serialize snapshot row")?;
            tx.execute(
                "INSERT OR REPLACE INTO snapshots (table_name, record_id, position, data)
                 VALUES (?1, ?2, ?3, ?4)",
                params![table_name, id, position as i64, data],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Last-known remote rows for a table, in fetch order
    pub fn snapshot(&self, table_name: &str) -> Result<Vec<Record>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT data FROM snapshots WHERE table_name = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![table_name], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let data = row?;
            let record: Record = serde_json::from_str(&data)
                .with_context(|| format!("Corrupt snapshot row in {table_name}"))?;
            out.push(record);
        }
        Ok(out)
    }
}
