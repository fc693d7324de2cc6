use async_trait::async_trait;
use fieldsync_core::storage::snapshots::Record;
use fieldsync_proto::MutationKind;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{BlobUpload, RemoteBackend, RemoteError, TableMutation};
use crate::network::ReachabilityProbe;

/// In-process backend with the same idempotency rules as the REST backend.
///
/// Failures can be scripted per call, which makes it the backend of choice
/// for exercising the drain loop without a server.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<HashMap<String, BTreeMap<String, Record>>>,
    blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
    applied: Mutex<Vec<TableMutation>>,
    scripted: Mutex<VecDeque<RemoteError>>,
    always: Mutex<Option<RemoteError>>,
    latency: Mutex<Option<Duration>>,
    unreachable: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with `error`
    pub fn fail_next(&self, count: usize, error: RemoteError) {
        let mut scripted = lock(&self.scripted);
        for _ in 0..count {
            scripted.push_back(error.clone());
        }
    }

    /// Make every call fail until `clear_failures`
    pub fn fail_always(&self, error: RemoteError) {
        *lock(&self.always) = Some(error);
    }

    pub fn clear_failures(&self) {
        lock(&self.scripted).clear();
        *lock(&self.always) = None;
    }

    /// Delay every call, to simulate a slow network
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn seed(&self, table: &str, record: Record) {
        if let Some(Value::String(id)) = record.get("id").cloned() {
            lock(&self.tables)
                .entry(table.to_string())
                .or_default()
                .insert(id, record);
        }
    }

    pub fn record(&self, table: &str, record_id: &str) -> Option<Record> {
        lock(&self.tables).get(table)?.get(record_id).cloned()
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        lock(&self.tables)
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn blob(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        lock(&self.blobs)
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
    }

    /// Successfully applied mutations, in order
    pub fn applied(&self) -> Vec<TableMutation> {
        lock(&self.applied).clone()
    }

    async fn gate(&self) -> Result<(), RemoteError> {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = lock(&self.scripted).pop_front() {
            return Err(error);
        }
        if let Some(error) = lock(&self.always).clone() {
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn apply(&self, mutation: &TableMutation) -> Result<(), RemoteError> {
        self.gate().await?;
        {
            let mut tables = lock(&self.tables);
            let rows = tables.entry(mutation.table.clone()).or_default();
            match mutation.kind {
                MutationKind::Insert => {
                    rows.entry(mutation.record_id.clone())
                        .or_insert_with(|| with_id(&mutation.payload, &mutation.record_id));
                }
                MutationKind::Upsert => {
                    rows.entry(mutation.record_id.clone())
                        .or_insert_with(|| with_id(&Record::new(), &mutation.record_id))
                        .extend(mutation.payload.clone());
                }
                MutationKind::Update => {
                    // PATCH on a missing row matches nothing and still succeeds
                    if let Some(row) = rows.get_mut(&mutation.record_id) {
                        row.extend(mutation.payload.clone());
                    }
                }
                MutationKind::Delete => {
                    rows.remove(&mutation.record_id);
                }
            }
        }
        lock(&self.applied).push(mutation.clone());
        Ok(())
    }

    async fn upload_blob(&self, upload: &BlobUpload) -> Result<String, RemoteError> {
        self.gate().await?;
        lock(&self.blobs).insert(
            (upload.bucket.clone(), upload.path.clone()),
            upload.bytes.clone(),
        );
        Ok(format!("memory://{}/{}", upload.bucket, upload.path))
    }

    async fn remove_blob(&self, bucket: &str, path: &str) -> Result<(), RemoteError> {
        self.gate().await?;
        lock(&self.blobs).remove(&(bucket.to_string(), path.to_string()));
        Ok(())
    }
}

#[async_trait]
impl ReachabilityProbe for MemoryBackend {
    async fn is_reachable(&self) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }
}

fn with_id(payload: &Record, record_id: &str) -> Record {
    let mut row = payload.clone();
    row.entry("id")
        .or_insert_with(|| Value::String(record_id.to_string()));
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mutation(kind: MutationKind, record_id: &str, payload: Value) -> TableMutation {
        TableMutation {
            table: "leads".into(),
            record_id: record_id.into(),
            kind,
            payload: payload.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn test_replayed_insert_is_ignored() {
        let backend = MemoryBackend::new();
        let insert = mutation(MutationKind::Insert, "I1", json!({"total_cents": 100}));
        backend.apply(&insert).await.unwrap();
        let mut replay = insert.clone();
        replay.payload.insert("total_cents".into(), json!(999));
        backend.apply(&replay).await.unwrap();
        assert_eq!(backend.record("leads", "I1").unwrap()["total_cents"], json!(100));
    }

    #[tokio::test]
    async fn test_update_of_missing_row_is_a_no_op() {
        let backend = MemoryBackend::new();
        backend
            .apply(&mutation(MutationKind::Update, "L1", json!({"status": "completed"})))
            .await
            .unwrap();
        assert!(backend.record("leads", "L1").is_none());
    }

    #[tokio::test]
    async fn test_scripted_failures_run_out() {
        let backend = MemoryBackend::new();
        backend.fail_next(1, RemoteError::Transient("offline".into()));
        let upsert = mutation(MutationKind::Upsert, "A1", json!({"latitude": 1.5}));
        assert!(backend.apply(&upsert).await.is_err());
        backend.apply(&upsert).await.unwrap();
        assert_eq!(backend.record("leads", "A1").unwrap()["id"], json!("A1"));
        assert_eq!(backend.applied().len(), 1);
    }
}
