use anyhow::Result;
use fieldsync_core::{LocalStore, SyncStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::network::NetworkMonitor;

/// Publishes `SyncStatus` to subscribers and owns the single-flight flag.
///
/// Status is recomputed from the queue on every refresh, never patched.
pub struct StatusHub {
    store: Arc<LocalStore>,
    monitor: NetworkMonitor,
    max_retries: u32,
    syncing: AtomicBool,
    tx: watch::Sender<SyncStatus>,
}

impl StatusHub {
    pub fn new(store: Arc<LocalStore>, monitor: NetworkMonitor, max_retries: u32) -> Self {
        let (tx, _) = watch::channel(SyncStatus::default());
        Self {
            store,
            monitor,
            max_retries,
            syncing: AtomicBool::new(false),
            tx,
        }
    }

    pub fn refresh(&self) -> Result<SyncStatus> {
        let operations = self.store.list_operations()?;
        let status = SyncStatus::from_operations(
            &operations,
            self.max_retries,
            self.monitor.is_online(),
            self.is_syncing(),
            self.store.last_sync_at()?,
        );
        self.tx.send_replace(status.clone());
        Ok(status)
    }

    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Claim the drain. False if another drain holds it.
    pub(crate) fn try_begin_sync(&self) -> bool {
        self.syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_sync(&self) {
        self.syncing.store(false, Ordering::SeqCst);
    }
}
