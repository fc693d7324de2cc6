use fieldsync_core::config::SyncSettings;
use fieldsync_core::models::NewPhoto;
use fieldsync_core::storage::snapshots::Record;
use fieldsync_core::LocalStore;
use fieldsync_proto::{
    AgentLocation, InvoiceDraft, JobStatus, LeadUpdate, LineItem, Operation, PhotoType,
    AGENT_LOCATIONS_TABLE, INVOICES_TABLE, LEADS_TABLE, PHOTOS_TABLE,
};
use fieldsync_syncd::{
    BlobUpload, DrainOutcome, DrainReport, MemoryBackend, NetworkMonitor, RemoteBackend,
    RemoteError, SyncService,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct Device {
    store: Arc<LocalStore>,
    backend: Arc<MemoryBackend>,
    monitor: NetworkMonitor,
    service: Arc<SyncService>,
}

fn device(online: bool) -> Device {
    device_with(online, SyncSettings::default())
}

fn device_with(online: bool, settings: SyncSettings) -> Device {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let backend = Arc::new(MemoryBackend::new());
    let monitor = NetworkMonitor::new(online);
    let service = SyncService::new(store.clone(), backend.clone(), monitor.clone(), &settings).unwrap();
    Device {
        store,
        backend,
        monitor,
        service,
    }
}

fn row(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

fn report(outcome: DrainOutcome) -> DrainReport {
    match outcome {
        DrainOutcome::Completed(report) => report,
        other => panic!("expected a completed pass, got {other:?}"),
    }
}

fn job_status(status: JobStatus) -> Operation {
    Operation::UpdateJobStatus(LeadUpdate::status(status))
}

#[tokio::test]
async fn status_update_offline_then_reconnect() {
    let d = device(false);
    d.backend.seed(LEADS_TABLE, row(json!({"id": "L1", "status": "assigned"})));
    d.service
        .store_snapshot(LEADS_TABLE, &[row(json!({"id": "L1", "status": "assigned"}))])
        .unwrap();

    d.service
        .queue_operation(job_status(JobStatus::InProgress), LEADS_TABLE, "L1")
        .unwrap();

    // Visible immediately, before anything reached the backend
    let view = d.service.view_table(LEADS_TABLE).unwrap();
    assert_eq!(view[0].data["status"], json!("in_progress"));
    assert!(view[0].has_pending_changes);
    assert_eq!(d.service.status().pending_count, 1);
    assert_eq!(d.service.sync_now().await.unwrap(), DrainOutcome::Offline);
    assert_eq!(d.backend.record(LEADS_TABLE, "L1").unwrap()["status"], json!("assigned"));

    d.service.set_online(true);
    let report = report(d.service.sync_now().await.unwrap());
    assert_eq!(report.applied, 1);
    assert_eq!(d.backend.record(LEADS_TABLE, "L1").unwrap()["status"], json!("in_progress"));

    let status = d.service.status();
    assert_eq!(status.pending_count, 0);
    assert!(status.is_online);
    assert!(!status.is_syncing);
    assert!(status.last_sync_at.is_some());
}

#[tokio::test]
async fn photo_upload_then_delete_offline() {
    let d = device(false);
    let (photo, _) = d
        .service
        .capture_photo(NewPhoto {
            lead_id: "L7".into(),
            data: vec![0xff, 0xd8, 0xff, 0xdb],
            caption: Some("Water heater".into()),
            photo_type: PhotoType::Before,
        })
        .unwrap();

    let gallery = d.service.view_photos("L7").unwrap();
    assert_eq!(gallery.len(), 1);
    assert!(gallery[0].pending_upload);

    d.service.delete_photo(photo.id).unwrap();
    assert!(d.service.view_photos("L7").unwrap().is_empty());
    assert_eq!(d.service.get_pending_operations().unwrap().len(), 2);

    d.service.set_online(true);
    let report = report(d.service.sync_now().await.unwrap());
    assert_eq!(report.applied, 2);
    assert!(d.store.get_photo(photo.id).unwrap().is_none());
    assert!(d.backend.record(PHOTOS_TABLE, &photo.remote_id.to_string()).is_none());
    assert!(d.backend.blob("job-photos", &photo.storage_path()).is_none());
    assert!(d.service.view_photos("L7").unwrap().is_empty());
}

#[tokio::test]
async fn three_failures_exhaust_but_keep_operation() {
    let d = device(true);
    d.backend.fail_always(RemoteError::Transient("502 Bad Gateway".into()));
    let id = d
        .service
        .queue_operation(job_status(JobStatus::Completed), LEADS_TABLE, "L1")
        .unwrap();

    for expected in 1..=3u32 {
        report(d.service.sync_now().await.unwrap());
        let op = d.store.get_operation(id).unwrap().unwrap();
        assert_eq!(op.retry_count, expected);
    }

    // A fourth automatic pass leaves it alone
    assert_eq!(report(d.service.sync_now().await.unwrap()), DrainReport::default());
    let op = d.store.get_operation(id).unwrap().unwrap();
    assert_eq!(op.retry_count, 3);
    assert!(op.last_error.unwrap().contains("502"));

    let status = d.service.status();
    assert_eq!(status.pending_count, 1);
    assert_eq!(status.failed_operations, 1);
    assert_eq!(status.exhausted_operations, 1);

    // Explicit retry once the backend recovers
    d.backend.clear_failures();
    assert_eq!(report(d.service.retry_failed_now().await.unwrap()).applied, 1);
    assert_eq!(d.service.status().pending_count, 0);
}

#[tokio::test]
async fn per_record_order_is_kept_across_failures() {
    let d = device(true);
    d.backend.seed(LEADS_TABLE, row(json!({"id": "L1"})));
    d.backend.fail_next(1, RemoteError::Transient("connection reset".into()));

    for status in [JobStatus::Assigned, JobStatus::InProgress, JobStatus::Completed] {
        d.service.queue_operation(job_status(status), LEADS_TABLE, "L1").unwrap();
    }

    let first = report(d.service.sync_now().await.unwrap());
    assert_eq!(first.failed, 1);
    assert_eq!(first.deferred, 2);
    assert!(d.backend.applied().is_empty());

    let second = report(d.service.sync_now().await.unwrap());
    assert_eq!(second.applied, 3);
    let statuses: Vec<Value> = d
        .backend
        .applied()
        .iter()
        .map(|m| m.payload["status"].clone())
        .collect();
    assert_eq!(statuses, vec![json!("assigned"), json!("in_progress"), json!("completed")]);
    assert_eq!(d.backend.record(LEADS_TABLE, "L1").unwrap()["status"], json!("completed"));
}

#[tokio::test]
async fn replayed_create_converges() {
    let d = device(true);
    let draft = InvoiceDraft::new(
        "L1",
        vec![LineItem {
            description: "Labor".into(),
            quantity: 2,
            unit_price_cents: 9_500,
        }],
        1_000,
    );
    let invoice_id = draft.id.to_string();
    let op = Operation::CreateInvoice(draft);

    // The first copy lands but the device never hears back
    d.store.enqueue(&op, INVOICES_TABLE, &invoice_id).unwrap();
    report(d.service.sync_now().await.unwrap());
    d.store.enqueue(&op, INVOICES_TABLE, &invoice_id).unwrap();
    report(d.service.sync_now().await.unwrap());

    assert_eq!(d.backend.rows(INVOICES_TABLE).len(), 1);
    let invoice = d.backend.record(INVOICES_TABLE, &invoice_id).unwrap();
    assert_eq!(invoice["subtotal_cents"], json!(19_000));
    assert_eq!(invoice["tax_cents"], json!(1_900));
    assert_eq!(invoice["total_cents"], json!(20_900));
}

#[tokio::test]
async fn rejection_is_not_retried_automatically() {
    let d = device(true);
    d.backend.fail_next(1, RemoteError::Rejected("400 invalid input value".into()));
    let id = d
        .service
        .queue_operation(job_status(JobStatus::Cancelled), LEADS_TABLE, "L1")
        .unwrap();

    assert_eq!(report(d.service.sync_now().await.unwrap()).exhausted, 1);
    assert_eq!(d.store.get_operation(id).unwrap().unwrap().retry_count, 3);

    assert_eq!(d.service.clear_failed_operations().unwrap(), 1);
    assert_eq!(d.service.status().pending_count, 0);
}

#[tokio::test]
async fn going_offline_mid_flight_does_not_count_a_failure() {
    let d = device_with(
        true,
        SyncSettings {
            request_timeout_seconds: 5,
            ..SyncSettings::default()
        },
    );
    d.backend.set_latency(Some(Duration::from_millis(100)));
    d.backend.fail_always(RemoteError::Transient("network unreachable".into()));
    let first = d
        .service
        .queue_operation(job_status(JobStatus::InProgress), LEADS_TABLE, "L1")
        .unwrap();
    d.service
        .queue_operation(job_status(JobStatus::InProgress), LEADS_TABLE, "L2")
        .unwrap();

    let service = d.service.clone();
    let pass = tokio::spawn(async move { service.sync_now().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    d.monitor.set_online(false);

    let report = report(pass.await.unwrap().unwrap());
    assert!(report.interrupted);
    assert_eq!(report.failed, 0);
    assert_eq!(d.store.get_operation(first).unwrap().unwrap().retry_count, 0);
    assert_eq!(d.service.status().pending_count, 2);
    assert!(d.store.last_sync_at().unwrap().is_none());
}

#[tokio::test]
async fn overlapping_drains_are_single_flight() {
    let d = device(true);
    d.backend.set_latency(Some(Duration::from_millis(100)));
    d.service
        .queue_operation(job_status(JobStatus::Assigned), LEADS_TABLE, "L1")
        .unwrap();

    let service = d.service.clone();
    let pass = tokio::spawn(async move { service.sync_now().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(d.service.status().is_syncing);
    assert_eq!(d.service.sync_now().await.unwrap(), DrainOutcome::AlreadyRunning);
    assert_eq!(report(pass.await.unwrap().unwrap()).applied, 1);
    assert_eq!(d.backend.applied().len(), 1);
    assert!(!d.service.status().is_syncing);
}

#[tokio::test]
async fn background_loop_drains_on_reconnect() {
    let d = device(false);
    let location = Operation::UpdateAgentLocation(AgentLocation {
        agent_id: "A9".into(),
        latitude: 40.7,
        longitude: -74.0,
        is_available: false,
        recorded_at: chrono::Utc::now(),
    });
    d.service
        .queue_operation(location, AGENT_LOCATIONS_TABLE, "A9")
        .unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(d.service.clone().run(async move {
        let _ = stop_rx.await;
    }));
    let mut status = d.service.subscribe_status();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(d.backend.applied().is_empty());

    d.service.set_online(true);
    tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.pending_count == 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        d.backend.record(AGENT_LOCATIONS_TABLE, "A9").unwrap()["is_available"],
        json!(false)
    );

    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn exhausted_operation_holds_back_its_record() {
    let d = device(true);
    d.backend.seed(LEADS_TABLE, row(json!({"id": "L1", "status": "assigned"})));
    d.backend.fail_always(RemoteError::Transient("502 Bad Gateway".into()));
    let first = d
        .service
        .queue_operation(job_status(JobStatus::InProgress), LEADS_TABLE, "L1")
        .unwrap();
    for _ in 0..3 {
        report(d.service.sync_now().await.unwrap());
    }
    assert_eq!(d.store.get_operation(first).unwrap().unwrap().retry_count, 3);

    d.backend.clear_failures();
    let second = d
        .service
        .queue_operation(job_status(JobStatus::Completed), LEADS_TABLE, "L1")
        .unwrap();
    d.backend.seed(LEADS_TABLE, row(json!({"id": "L2"})));
    d.service
        .queue_operation(job_status(JobStatus::Assigned), LEADS_TABLE, "L2")
        .unwrap();

    let pass = report(d.service.sync_now().await.unwrap());
    assert_eq!(pass.deferred, 1);
    assert_eq!(pass.applied, 1);
    assert_eq!(d.store.get_operation(second).unwrap().unwrap().retry_count, 0);
    assert_eq!(d.backend.record(LEADS_TABLE, "L1").unwrap()["status"], json!("assigned"));

    let retry = report(d.service.retry_failed_now().await.unwrap());
    assert_eq!(retry.applied, 2);
    let statuses: Vec<Value> = d
        .backend
        .applied()
        .iter()
        .filter(|m| m.record_id == "L1")
        .map(|m| m.payload["status"].clone())
        .collect();
    assert_eq!(statuses, vec![json!("in_progress"), json!("completed")]);
    assert_eq!(d.backend.record(LEADS_TABLE, "L1").unwrap()["status"], json!("completed"));
}

#[tokio::test]
async fn photo_delete_waits_for_exhausted_upload() {
    let d = device(true);
    let (photo, _) = d
        .service
        .capture_photo(NewPhoto {
            lead_id: "L4".into(),
            data: vec![7, 7, 7],
            caption: None,
            photo_type: PhotoType::After,
        })
        .unwrap();
    d.backend.fail_always(RemoteError::Transient("connection reset".into()));
    for _ in 0..3 {
        report(d.service.sync_now().await.unwrap());
    }
    d.backend.clear_failures();
    d.service.delete_photo(photo.id).unwrap();

    let pass = report(d.service.sync_now().await.unwrap());
    assert_eq!(pass.deferred, 1);
    assert_eq!(pass.applied, 0);
    assert!(d.store.get_photo(photo.id).unwrap().unwrap().marked_for_deletion);

    let retry = report(d.service.retry_failed_now().await.unwrap());
    assert_eq!(retry.applied, 2);
    assert!(d.store.get_photo(photo.id).unwrap().is_none());
    assert!(d.backend.record(PHOTOS_TABLE, &photo.remote_id.to_string()).is_none());
    assert!(d.backend.blob("job-photos", &photo.storage_path()).is_none());
}

#[tokio::test]
async fn remote_only_photo_is_deleted() {
    let d = device(false);
    let remote_id = uuid::Uuid::new_v4();
    let photo_row = row(json!({
        "id": remote_id.to_string(),
        "lead_id": "L3",
        "photo_type": "after",
        "storage_path": "L3/finished.jpg",
    }));
    d.backend.seed(PHOTOS_TABLE, photo_row.clone());
    d.backend
        .upload_blob(&BlobUpload {
            bucket: "job-photos".into(),
            path: "L3/finished.jpg".into(),
            bytes: vec![1, 2],
            content_type: "image/jpeg".into(),
        })
        .await
        .unwrap();
    d.service.store_snapshot(PHOTOS_TABLE, &[photo_row]).unwrap();
    assert_eq!(d.service.view_photos("L3").unwrap().len(), 1);

    d.service
        .delete_remote_photo(remote_id, Some("L3/finished.jpg".into()))
        .unwrap();
    assert!(d.service.view_photos("L3").unwrap().is_empty());

    d.service.set_online(true);
    assert_eq!(report(d.service.sync_now().await.unwrap()).applied, 1);
    assert!(d.backend.record(PHOTOS_TABLE, &remote_id.to_string()).is_none());
    assert!(d.backend.blob("job-photos", "L3/finished.jpg").is_none());
}

#[tokio::test]
async fn reachability_check_drives_monitor() {
    let d = device(true);
    let mut online = d.monitor.watch();
    d.backend.set_reachable(false);
    let probe = d.monitor.spawn_probe(d.backend.clone(), Duration::from_millis(10));

    tokio::time::timeout(Duration::from_secs(2), online.wait_for(|up| !*up))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(d.service.sync_now().await.unwrap(), DrainOutcome::Offline);

    d.backend.set_reachable(true);
    tokio::time::timeout(Duration::from_secs(2), online.wait_for(|up| *up))
        .await
        .unwrap()
        .unwrap();
    probe.abort();
}
