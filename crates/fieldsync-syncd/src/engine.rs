use anyhow::Result;
use chrono::Utc;
use fieldsync_core::config::SyncSettings;
use fieldsync_core::storage::snapshots::Record;
use fieldsync_core::{LocalPhotoRecord, LocalStore, PendingOperation};
use fieldsync_proto::{MutationKind, Operation};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{BlobUpload, RemoteBackend, RemoteError, TableMutation};
use crate::network::NetworkMonitor;
use crate::status::StatusHub;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Skip operations that reached the retry ceiling
    Automatic,
    /// User asked to retry: exhausted operations get one more attempt
    RetryFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub applied: usize,
    /// Failed but still below the retry ceiling
    pub failed: usize,
    /// Failed and now at the retry ceiling
    pub exhausted: usize,
    /// Skipped because an earlier operation on the same record failed
    pub deferred: usize,
    /// The pass stopped because the network went away
    pub interrupted: bool,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.exhausted == 0 && self.deferred == 0 && !self.interrupted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    AlreadyRunning,
    Offline,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub photo_bucket: String,
}

impl From<&SyncSettings> for EngineSettings {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            max_retries: settings.max_retries.max(1),
            request_timeout: settings.request_timeout(),
            photo_bucket: settings.photo_bucket.clone(),
        }
    }
}

/// What one queued operation turns into on the wire
enum Prepared {
    Table(TableMutation),
    Upload {
        photo: LocalPhotoRecord,
        storage_path: String,
        row: TableMutation,
    },
    DeletePhoto {
        local_photo_id: Option<i64>,
        row: Option<TableMutation>,
        storage_path: Option<String>,
    },
    /// Nothing left to send; the entry is simply dropped
    Skip(&'static str),
}

/// Resets the single-flight flag however the pass ends
struct SyncGuard<'a> {
    status: &'a StatusHub,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.status.end_sync();
        if let Err(e) = self.status.refresh() {
            warn!("Failed to refresh sync status: {e:#}");
        }
    }
}

pub struct SyncEngine {
    store: Arc<LocalStore>,
    backend: Arc<dyn RemoteBackend>,
    monitor: NetworkMonitor,
    status: Arc<StatusHub>,
    settings: EngineSettings,
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        monitor: NetworkMonitor,
        status: Arc<StatusHub>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            backend,
            monitor,
            status,
            settings,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.settings.max_retries
    }

    /// Run one pass over the queue. Overlapping calls return `AlreadyRunning`.
    pub async fn drain(&self, mode: DrainMode) -> Result<DrainOutcome> {
        if !self.monitor.is_online() {
            debug!("Skipping drain while offline");
            return Ok(DrainOutcome::Offline);
        }
        if !self.status.try_begin_sync() {
            debug!("Drain already in progress");
            return Ok(DrainOutcome::AlreadyRunning);
        }
        let _guard = SyncGuard {
            status: &self.status,
        };
        self.status.refresh()?;

        let report = self.run_pass(mode).await?;
        if report.applied > 0 || report.is_clean() {
            self.store.set_last_sync_at(Utc::now())?;
        }
        if report == DrainReport::default() {
            debug!("Queue empty, nothing to drain");
        } else {
            info!(
                applied = report.applied,
                failed = report.failed,
                exhausted = report.exhausted,
                deferred = report.deferred,
                interrupted = report.interrupted,
                "Drain pass finished"
            );
        }
        Ok(DrainOutcome::Completed(report))
    }

    async fn run_pass(&self, mode: DrainMode) -> Result<DrainReport> {
        let ceiling = match mode {
            DrainMode::Automatic => Some(self.settings.max_retries),
            DrainMode::RetryFailed => None,
        };
        let mut report = DrainReport::default();
        let mut blocked: HashSet<(String, String)> = HashSet::new();
        if let Some(max) = ceiling {
            // Exhausted operations are not attempted, but nothing on their
            // record may overtake them
            for op in self.store.list_operations()? {
                if op.is_exhausted(max) {
                    blocked.insert((op.table_name, op.record_id));
                }
            }
        }
        let mut cursor = 0;

        while let Some(op) = self.store.next_after(cursor, ceiling)? {
            cursor = op.id;
            if !self.monitor.is_online() {
                report.interrupted = true;
                break;
            }
            let key = (op.table_name.clone(), op.record_id.clone());
            if blocked.contains(&key) {
                debug!(id = op.id, kind = %op.kind(), "Deferred behind a failed operation on the same record");
                report.deferred += 1;
                continue;
            }

            let prepared = self.prepare(&op)?;
            match self.execute(&prepared).await {
                Ok(()) => {
                    self.complete(&op, &prepared)?;
                    report.applied += 1;
                }
                Err(error) if error.is_retryable() && !self.monitor.is_online() => {
                    // Lost the network mid-flight; the attempt does not count
                    debug!(id = op.id, "Attempt interrupted by network loss: {error}");
                    report.interrupted = true;
                    break;
                }
                Err(error) => {
                    blocked.insert(key);
                    let message = error.to_string();
                    let retry_count = match error {
                        RemoteError::Rejected(_) => {
                            self.store
                                .mark_exhausted(op.id, self.settings.max_retries, &message)?
                        }
                        RemoteError::Transient(_) => self.store.record_failure(op.id, &message)?,
                    };
                    if retry_count >= self.settings.max_retries {
                        warn!(id = op.id, kind = %op.kind(), retry_count, "Operation failed, giving up until retried: {message}");
                        report.exhausted += 1;
                    } else {
                        warn!(id = op.id, kind = %op.kind(), retry_count, "Operation failed, will retry: {message}");
                        report.failed += 1;
                    }
                }
            }
            self.status.refresh()?;
        }
        Ok(report)
    }

    fn prepare(&self, op: &PendingOperation) -> Result<Prepared> {
        let prepared = match &op.operation {
            Operation::UploadPhoto(upload) => match self.store.get_photo(upload.local_photo_id)? {
                Some(photo) => Prepared::Upload {
                    photo,
                    storage_path: upload.storage_path.clone(),
                    row: TableMutation {
                        table: op.table_name.clone(),
                        record_id: op.record_id.clone(),
                        kind: MutationKind::Insert,
                        payload: upload.row(),
                    },
                },
                None => Prepared::Skip("local photo no longer exists"),
            },
            Operation::DeletePhoto(deletion) => {
                let local = match deletion.local_photo_id {
                    Some(id) => self.store.get_photo(id)?,
                    None => None,
                };
                // A photo that never left the device only needs the local purge
                let remote_copy = local.as_ref().map_or(true, |photo| photo.uploaded);
                let storage_path = deletion.storage_path.clone().or_else(|| {
                    local
                        .as_ref()
                        .map(|photo| photo.remote_path.clone().unwrap_or_else(|| photo.storage_path()))
                });
                Prepared::DeletePhoto {
                    local_photo_id: local.as_ref().map(|photo| photo.id),
                    row: remote_copy.then(|| TableMutation {
                        table: op.table_name.clone(),
                        record_id: op.record_id.clone(),
                        kind: MutationKind::Delete,
                        payload: Record::new(),
                    }),
                    storage_path: if remote_copy { storage_path } else { None },
                }
            }
            operation => Prepared::Table(self.mutation_for(op, operation)),
        };
        Ok(prepared)
    }

    fn mutation_for(&self, op: &PendingOperation, operation: &Operation) -> TableMutation {
        let kind = operation.mutation_kind();
        let mut payload = operation.payload();
        if matches!(kind, MutationKind::Insert | MutationKind::Upsert) {
            payload
                .entry("id")
                .or_insert_with(|| Value::String(op.record_id.clone()));
        }
        TableMutation {
            table: op.table_name.clone(),
            record_id: op.record_id.clone(),
            kind,
            payload,
        }
    }

    async fn execute(&self, prepared: &Prepared) -> Result<(), RemoteError> {
        match prepared {
            Prepared::Table(mutation) => self.call(self.backend.apply(mutation)).await,
            Prepared::Upload {
                photo,
                storage_path,
                row,
            } => {
                let upload = BlobUpload {
                    bucket: self.settings.photo_bucket.clone(),
                    path: storage_path.clone(),
                    bytes: photo.data.clone(),
                    content_type: "image/jpeg".to_string(),
                };
                let url = self.call(self.backend.upload_blob(&upload)).await?;
                let mut row = row.clone();
                row.payload.insert("photo_url".into(), Value::String(url));
                self.call(self.backend.apply(&row)).await
            }
            Prepared::DeletePhoto {
                row, storage_path, ..
            } => {
                if let Some(row) = row {
                    self.call(self.backend.apply(row)).await?;
                }
                if let Some(path) = storage_path {
                    self.call(self.backend.remove_blob(&self.settings.photo_bucket, path))
                        .await?;
                }
                Ok(())
            }
            Prepared::Skip(_) => Ok(()),
        }
    }

    /// Apply local side effects and drop the queue entry
    fn complete(&self, op: &PendingOperation, prepared: &Prepared) -> Result<()> {
        match prepared {
            Prepared::Upload {
                photo,
                storage_path,
                ..
            } => self.store.mark_photo_uploaded(photo.id, storage_path)?,
            Prepared::DeletePhoto {
                local_photo_id: Some(id),
                ..
            } => {
                self.store.purge_photo(*id)?;
            }
            Prepared::Skip(reason) => debug!(id = op.id, kind = %op.kind(), "Dropping operation: {reason}"),
            _ => {}
        }
        self.store.delete_operation(op.id)?;
        debug!(id = op.id, kind = %op.kind(), record_id = %op.record_id, "Operation applied");
        Ok(())
    }

    async fn call<T>(&self, request: impl Future<Output = Result<T, RemoteError>>) -> Result<T, RemoteError> {
        let limit = self.settings.request_timeout;
        match tokio::time::timeout(limit, request).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transient(format!(
                "request timed out after {}ms",
                limit.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use fieldsync_core::models::NewPhoto;
    use fieldsync_proto::{
        AgentLocation, JobStatus, LeadUpdate, PhotoDeletion, PhotoType, PhotoUpload, LEADS_TABLE,
        PHOTOS_TABLE,
    };
    use serde_json::json;

    struct Harness {
        store: Arc<LocalStore>,
        backend: Arc<MemoryBackend>,
        monitor: NetworkMonitor,
        engine: SyncEngine,
    }

    fn harness(request_timeout: Duration) -> Harness {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let backend = Arc::new(MemoryBackend::new());
        let monitor = NetworkMonitor::new(true);
        let status = Arc::new(StatusHub::new(store.clone(), monitor.clone(), 3));
        let engine = SyncEngine::new(
            store.clone(),
            backend.clone(),
            monitor.clone(),
            status,
            EngineSettings {
                max_retries: 3,
                request_timeout,
                photo_bucket: "job-photos".into(),
            },
        );
        Harness {
            store,
            backend,
            monitor,
            engine,
        }
    }

    fn status_update(status: JobStatus) -> Operation {
        Operation::UpdateJobStatus(LeadUpdate::status(status))
    }

    fn completed(outcome: DrainOutcome) -> DrainReport {
        match outcome {
            DrainOutcome::Completed(report) => report,
            other => panic!("expected a completed pass, got {other:?}"),
        }
    }

    #[test]
    fn test_settings_keep_at_least_one_attempt() {
        let settings = SyncSettings {
            max_retries: 0,
            ..SyncSettings::default()
        };
        assert_eq!(EngineSettings::from(&settings).max_retries, 1);
    }

    #[tokio::test]
    async fn test_drain_applies_in_order_and_records_sync_time() {
        let h = harness(Duration::from_secs(5));
        h.backend.seed(LEADS_TABLE, json!({"id": "L1"}).as_object().cloned().unwrap());
        h.store
            .enqueue(&status_update(JobStatus::InProgress), LEADS_TABLE, "L1")
            .unwrap();
        h.store
            .enqueue(&status_update(JobStatus::Completed), LEADS_TABLE, "L1")
            .unwrap();

        let report = completed(h.engine.drain(DrainMode::Automatic).await.unwrap());
        assert_eq!(report.applied, 2);
        assert!(report.is_clean());
        assert_eq!(h.store.count_operations().unwrap(), 0);
        assert_eq!(h.backend.record(LEADS_TABLE, "L1").unwrap()["status"], json!("completed"));
        assert!(h.store.last_sync_at().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failure_defers_same_record_only() {
        let h = harness(Duration::from_secs(5));
        h.backend.fail_next(1, RemoteError::Transient("connection reset".into()));
        let first = h
            .store
            .enqueue(&status_update(JobStatus::InProgress), LEADS_TABLE, "L1")
            .unwrap();
        h.store
            .enqueue(&status_update(JobStatus::Completed), LEADS_TABLE, "L1")
            .unwrap();
        let location = Operation::UpdateAgentLocation(AgentLocation {
            agent_id: "A1".into(),
            latitude: 1.0,
            longitude: 2.0,
            is_available: true,
            recorded_at: Utc::now(),
        });
        h.store.enqueue(&location, "agent_locations", "A1").unwrap();

        let report = completed(h.engine.drain(DrainMode::Automatic).await.unwrap());
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.applied, 1);

        let remaining = h.store.list_operations().unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].id, first);
        assert_eq!(remaining[0].retry_count, 1);
        assert_eq!(remaining[1].retry_count, 0);
        assert!(h.backend.record("agent_locations", "A1").is_some());
    }

    #[tokio::test]
    async fn test_offline_drain_does_nothing() {
        let h = harness(Duration::from_secs(5));
        h.monitor.set_online(false);
        h.store
            .enqueue(&status_update(JobStatus::InProgress), LEADS_TABLE, "L1")
            .unwrap();
        let outcome = h.engine.drain(DrainMode::Automatic).await.unwrap();
        assert_eq!(outcome, DrainOutcome::Offline);
        assert_eq!(h.store.list_operations().unwrap()[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_rejection_exhausts_then_retry_failed_attempts_again() {
        let h = harness(Duration::from_secs(5));
        h.backend.fail_next(1, RemoteError::Rejected("violates check constraint".into()));
        let id = h
            .store
            .enqueue(&status_update(JobStatus::Cancelled), LEADS_TABLE, "L1")
            .unwrap();

        let report = completed(h.engine.drain(DrainMode::Automatic).await.unwrap());
        assert_eq!(report.exhausted, 1);
        let op = h.store.get_operation(id).unwrap().unwrap();
        assert_eq!(op.retry_count, 3);
        assert!(op.last_error.unwrap().contains("check constraint"));

        // Exhausted ops are skipped automatically
        let report = completed(h.engine.drain(DrainMode::Automatic).await.unwrap());
        assert_eq!(report, DrainReport::default());

        let report = completed(h.engine.drain(DrainMode::RetryFailed).await.unwrap());
        assert_eq!(report.applied, 1);
        assert_eq!(h.store.count_operations().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient_failure() {
        let h = harness(Duration::from_millis(20));
        h.backend.set_latency(Some(Duration::from_millis(200)));
        let id = h
            .store
            .enqueue(&status_update(JobStatus::InProgress), LEADS_TABLE, "L1")
            .unwrap();

        let report = completed(h.engine.drain(DrainMode::Automatic).await.unwrap());
        assert_eq!(report.failed, 1);
        let op = h.store.get_operation(id).unwrap().unwrap();
        assert_eq!(op.retry_count, 1);
        assert!(op.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_photo_upload_then_delete() {
        let h = harness(Duration::from_secs(5));
        let photo = h
            .store
            .insert_photo(&NewPhoto {
                lead_id: "L1".into(),
                data: vec![0xff, 0xd8, 0xff],
                caption: Some("panel".into()),
                photo_type: PhotoType::Before,
            })
            .unwrap();
        let remote_id = photo.remote_id.to_string();
        let upload = Operation::UploadPhoto(PhotoUpload {
            local_photo_id: photo.id,
            remote_id: photo.remote_id,
            lead_id: "L1".into(),
            photo_type: PhotoType::Before,
            caption: photo.caption.clone(),
            storage_path: photo.storage_path(),
        });
        h.store.enqueue(&upload, PHOTOS_TABLE, &remote_id).unwrap();

        completed(h.engine.drain(DrainMode::Automatic).await.unwrap());
        let stored = h.store.get_photo(photo.id).unwrap().unwrap();
        assert!(stored.uploaded);
        assert_eq!(stored.remote_path.as_deref(), Some(photo.storage_path().as_str()));
        assert_eq!(
            h.backend.blob("job-photos", &photo.storage_path()),
            Some(vec![0xff, 0xd8, 0xff])
        );
        let row = h.backend.record(PHOTOS_TABLE, &remote_id).unwrap();
        assert!(row["photo_url"].as_str().unwrap().starts_with("memory://"));

        let delete = Operation::DeletePhoto(PhotoDeletion {
            local_photo_id: Some(photo.id),
            remote_id: photo.remote_id,
            storage_path: None,
        });
        h.store.enqueue(&delete, PHOTOS_TABLE, &remote_id).unwrap();
        completed(h.engine.drain(DrainMode::Automatic).await.unwrap());

        assert!(h.store.get_photo(photo.id).unwrap().is_none());
        assert!(h.backend.record(PHOTOS_TABLE, &remote_id).is_none());
        assert!(h.backend.blob("job-photos", &photo.storage_path()).is_none());
    }

    #[tokio::test]
    async fn test_upload_of_purged_photo_is_dropped() {
        let h = harness(Duration::from_secs(5));
        let upload = Operation::UploadPhoto(PhotoUpload {
            local_photo_id: 42,
            remote_id: uuid::Uuid::new_v4(),
            lead_id: "L1".into(),
            photo_type: PhotoType::After,
            caption: None,
            storage_path: "L1/gone.jpg".into(),
        });
        h.store.enqueue(&upload, PHOTOS_TABLE, "P1").unwrap();

        let report = completed(h.engine.drain(DrainMode::Automatic).await.unwrap());
        assert_eq!(report.applied, 1);
        assert!(h.backend.applied().is_empty());
    }
}
