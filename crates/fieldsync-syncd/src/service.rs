//! The surface the app talks to: queue writes, queue management, status and
//! overlay views, plus the scheduled loop that keeps the queue draining.

use anyhow::{anyhow, bail, Result};
use fieldsync_core::config::SyncSettings;
use fieldsync_core::models::NewPhoto;
use fieldsync_core::overlay::{self, OverlayRecord};
use fieldsync_core::storage::snapshots::Record;
use fieldsync_core::{LocalPhotoRecord, LocalStore, PendingOperation, PhotoView, SyncStatus};
use fieldsync_proto::{Operation, PhotoDeletion, PhotoUpload, PHOTOS_TABLE};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::RemoteBackend;
use crate::engine::{DrainMode, DrainOutcome, EngineSettings, SyncEngine};
use crate::network::NetworkMonitor;
use crate::status::StatusHub;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Enqueued,
    Manual,
    RetryFailed,
}

/// Constructed once per process and shared as `Arc<SyncService>`.
pub struct SyncService {
    store: Arc<LocalStore>,
    monitor: NetworkMonitor,
    status: Arc<StatusHub>,
    engine: SyncEngine,
    interval: Duration,
    triggers: UnboundedSender<Trigger>,
    trigger_rx: Mutex<Option<UnboundedReceiver<Trigger>>>,
}

impl SyncService {
    pub fn new(
        store: Arc<LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        monitor: NetworkMonitor,
        settings: &SyncSettings,
    ) -> Result<Arc<Self>> {
        let engine_settings = EngineSettings::from(settings);
        let status = Arc::new(StatusHub::new(
            store.clone(),
            monitor.clone(),
            engine_settings.max_retries,
        ));
        status.refresh()?;
        let engine = SyncEngine::new(
            store.clone(),
            backend,
            monitor.clone(),
            status.clone(),
            engine_settings,
        );
        let (triggers, trigger_rx) = unbounded_channel();
        Ok(Arc::new(Self {
            store,
            monitor,
            status,
            engine,
            interval: settings.interval(),
            triggers,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        }))
    }

    /// Persist an operation. Succeeds offline; only a storage failure is an error.
    pub fn queue_operation(&self, operation: Operation, table_name: &str, record_id: &str) -> Result<i64> {
        let id = self.store.enqueue(&operation, table_name, record_id)?;
        debug!(id, kind = %operation.kind(), table = table_name, record_id, "Queued operation");
        self.publish();
        self.trigger(Trigger::Enqueued);
        Ok(id)
    }

    pub fn get_pending_operations(&self) -> Result<Vec<PendingOperation>> {
        self.store.list_operations()
    }

    /// Discard one queued operation. Returns false if it was not queued.
    pub fn delete_operation(&self, id: i64) -> Result<bool> {
        let discarded = self.store.discard_operation(id)?;
        if let Some(op) = &discarded {
            info!(id, kind = %op.kind(), "Discarded operation");
        }
        self.publish();
        Ok(discarded.is_some())
    }

    /// Discard every operation that has failed at least once
    pub fn clear_failed_operations(&self) -> Result<usize> {
        let count = self.store.clear_failed_operations()?;
        if count > 0 {
            info!(count, "Cleared failed operations");
        }
        self.publish();
        Ok(count)
    }

    /// Ask the background loop for a pass that includes exhausted operations
    pub fn retry_failed_operations(&self) {
        self.trigger(Trigger::RetryFailed);
    }

    /// Ask the background loop for a pass
    pub fn request_sync(&self) {
        self.trigger(Trigger::Manual);
    }

    /// Drain now on the caller's task
    pub async fn sync_now(&self) -> Result<DrainOutcome> {
        self.engine.drain(DrainMode::Automatic).await
    }

    pub async fn retry_failed_now(&self) -> Result<DrainOutcome> {
        self.engine.drain(DrainMode::RetryFailed).await
    }

    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Feed a platform connectivity signal
    pub fn set_online(&self, online: bool) {
        self.monitor.set_online(online);
        self.publish();
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    /// Keep a captured photo on the device and queue its upload
    pub fn capture_photo(&self, photo: NewPhoto) -> Result<(LocalPhotoRecord, i64)> {
        let record = self.store.insert_photo(&photo)?;
        let upload = Operation::UploadPhoto(PhotoUpload {
            local_photo_id: record.id,
            remote_id: record.remote_id,
            lead_id: record.lead_id.clone(),
            photo_type: record.photo_type,
            caption: record.caption.clone(),
            storage_path: record.storage_path(),
        });
        let op_id = match self.queue_operation(upload, PHOTOS_TABLE, &record.remote_id.to_string()) {
            Ok(id) => id,
            Err(e) => {
                // Never keep a photo nothing will upload
                self.store.purge_photo(record.id)?;
                return Err(e);
            }
        };
        Ok((record, op_id))
    }

    /// Hide a local photo now and queue its removal from the backend
    pub fn delete_photo(&self, local_photo_id: i64) -> Result<i64> {
        let photo = self
            .store
            .get_photo(local_photo_id)?
            .ok_or_else(|| anyhow!("Photo {local_photo_id} not found"))?;
        if photo.marked_for_deletion {
            bail!("Photo {local_photo_id} is already queued for deletion");
        }
        let deletion = Operation::DeletePhoto(PhotoDeletion {
            local_photo_id: Some(photo.id),
            remote_id: photo.remote_id,
            storage_path: photo.remote_path.clone(),
        });
        let id = self.queue_operation(deletion, PHOTOS_TABLE, &photo.remote_id.to_string())?;
        self.store.set_photo_marked_for_deletion(photo.id, true)?;
        self.publish();
        Ok(id)
    }

    /// Queue removal of a photo that only exists on the backend
    pub fn delete_remote_photo(&self, remote_id: Uuid, storage_path: Option<String>) -> Result<i64> {
        let deletion = Operation::DeletePhoto(PhotoDeletion {
            local_photo_id: None,
            remote_id,
            storage_path,
        });
        self.queue_operation(deletion, PHOTOS_TABLE, &remote_id.to_string())
    }

    /// Replace the cached remote rows of a table
    pub fn store_snapshot(&self, table_name: &str, rows: &[Record]) -> Result<()> {
        self.store.replace_snapshot(table_name, rows)
    }

    pub fn view_table(&self, table_name: &str) -> Result<Vec<OverlayRecord>> {
        let snapshot = self.store.snapshot(table_name)?;
        let pending = self.store.list_operations()?;
        Ok(overlay::merge(table_name, &snapshot, &pending))
    }

    pub fn view_photos(&self, lead_id: &str) -> Result<Vec<PhotoView>> {
        let remote = self.store.snapshot(PHOTOS_TABLE)?;
        let local = self.store.list_photos(Some(lead_id))?;
        let pending = self.store.list_operations()?;
        Ok(overlay::merge_photos(lead_id, &remote, &local, &pending))
    }

    /// Drive the queue until `shutdown` resolves.
    ///
    /// Drains on reconnect, on every tick, after an enqueue and on request.
    /// Triggers that arrive while a pass runs collapse into the next pass.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut triggers = self.take_triggers()?;
        let mut reconnects = self.monitor.subscribe();
        let mut connectivity = self.monitor.watch();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(interval_seconds = self.interval.as_secs(), "Sync loop started");
        loop {
            let mode = tokio::select! {
                _ = &mut shutdown => {
                    info!("Sync loop stopping");
                    break;
                }
                Some(()) = reconnects.recv() => {
                    info!("Back online, draining queue");
                    DrainMode::Automatic
                }
                _ = ticker.tick() => DrainMode::Automatic,
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => coalesce(trigger, &mut triggers),
                    None => break,
                },
                Ok(()) = connectivity.changed() => {
                    self.publish();
                    continue;
                }
            };

            match self.engine.drain(mode).await {
                Ok(DrainOutcome::Completed(_)) | Ok(DrainOutcome::Offline) => {}
                Ok(DrainOutcome::AlreadyRunning) => debug!("Drain skipped, another pass is running"),
                Err(e) => error!("Drain failed: {e:#}"),
            }
        }
        Ok(())
    }

    fn take_triggers(&self) -> Result<UnboundedReceiver<Trigger>> {
        self.trigger_rx
            .lock()
            .map_err(|_| anyhow!("Trigger channel lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("Sync loop is already running"))
    }

    fn trigger(&self, trigger: Trigger) {
        if trigger == Trigger::Enqueued && !self.monitor.is_online() {
            return;
        }
        if self.triggers.send(trigger).is_err() {
            debug!(?trigger, "Sync loop not running, trigger dropped");
        }
    }

    fn publish(&self) {
        if let Err(e) = self.status.refresh() {
            warn!("Failed to refresh sync status: {e:#}");
        }
    }
}

/// Fold every queued trigger into one pass
fn coalesce(first: Trigger, triggers: &mut UnboundedReceiver<Trigger>) -> DrainMode {
    let mut retry_failed = first == Trigger::RetryFailed;
    while let Ok(next) = triggers.try_recv() {
        retry_failed |= next == Trigger::RetryFailed;
    }
    if retry_failed {
        DrainMode::RetryFailed
    } else {
        DrainMode::Automatic
    }
}
