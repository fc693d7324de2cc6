//! Optimistic overlay: what the UI shows before the queue has drained.
//!
//! Everything here is a pure function of a remote snapshot and the queued
//! operations. Nothing touches storage or the network.

use fieldsync_proto::{MutationKind, Operation, PhotoType};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::models::{LocalPhotoRecord, PendingOperation, PhotoView};
use crate::storage::snapshots::{record_id, Record};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayRecord {
    pub record_id: String,
    pub data: Record,
    /// At least one queued operation touches this record
    pub has_pending_changes: bool,
    /// Exists only on the device until its create operation is applied
    pub locally_created: bool,
}

/// Merge queued operations for `table_name` onto the snapshot of that table.
///
/// Operations apply oldest first. Snapshot rows keep their order; records
/// synthesized from queued creates follow in queue order.
pub fn merge(table_name: &str, snapshot: &[Record], pending: &[PendingOperation]) -> Vec<OverlayRecord> {
    let mut slots: Vec<Option<OverlayRecord>> = Vec::with_capacity(snapshot.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in snapshot {
        let Some(id) = record_id(row) else { continue };
        index.insert(id.clone(), slots.len());
        slots.push(Some(OverlayRecord {
            record_id: id,
            data: row.clone(),
            has_pending_changes: false,
            locally_created: false,
        }));
    }

    for op in in_queue_order(pending) {
        if op.table_name != table_name {
            continue;
        }
        let existing = index.get(&op.record_id).copied();
        match (op.operation.mutation_kind(), existing) {
            (MutationKind::Delete, Some(pos)) => {
                slots[pos] = None;
                index.remove(&op.record_id);
            }
            (MutationKind::Delete, None) => {}
            (_, Some(pos)) => {
                if let Some(record) = slots[pos].as_mut() {
                    record.data.extend(op.operation.payload());
                    record.has_pending_changes = true;
                }
            }
            (MutationKind::Insert | MutationKind::Upsert, None) => {
                let mut data = op.operation.payload();
                data.insert("id".into(), Value::String(op.record_id.clone()));
                index.insert(op.record_id.clone(), slots.len());
                slots.push(Some(OverlayRecord {
                    record_id: op.record_id.clone(),
                    data,
                    has_pending_changes: true,
                    locally_created: true,
                }));
            }
            // An update for a record this device has never seen has nothing to land on
            (MutationKind::Update, None) => {}
        }
    }

    slots.into_iter().flatten().collect()
}

/// Merge the photo gallery of one lead.
///
/// Remote rows queued for deletion are hidden, local photos that have not
/// reached the backend are shown, and local photos marked for deletion or
/// referenced by a queued delete never appear.
pub fn merge_photos(
    lead_id: &str,
    remote_rows: &[Record],
    local: &[LocalPhotoRecord],
    pending: &[PendingOperation],
) -> Vec<PhotoView> {
    let mut deleted_remote: HashSet<String> = HashSet::new();
    let mut deleted_local: HashSet<i64> = HashSet::new();
    for op in pending {
        if let Operation::DeletePhoto(deletion) = &op.operation {
            deleted_remote.insert(deletion.remote_id.to_string());
            if let Some(local_id) = deletion.local_photo_id {
                deleted_local.insert(local_id);
            }
        }
    }

    let mut shown: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    for row in remote_rows {
        let Some(id) = record_id(row) else { continue };
        if deleted_remote.contains(&id) {
            continue;
        }
        let row_lead = row.get("lead_id").and_then(Value::as_str);
        if row_lead.is_some_and(|l| l != lead_id) {
            continue;
        }
        shown.insert(id.clone());
        out.push(PhotoView {
            remote_id: id,
            lead_id: lead_id.to_string(),
            photo_type: row
                .get("photo_type")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<PhotoType>().ok()),
            caption: row.get("caption").and_then(Value::as_str).map(String::from),
            url: row.get("photo_url").and_then(Value::as_str).map(String::from),
            local_photo_id: None,
            pending_upload: false,
        });
    }

    for photo in local {
        let remote_id = photo.remote_id.to_string();
        if photo.lead_id != lead_id
            || photo.marked_for_deletion
            || deleted_local.contains(&photo.id)
            || deleted_remote.contains(&remote_id)
            || shown.contains(&remote_id)
        {
            continue;
        }
        out.push(PhotoView {
            remote_id,
            lead_id: photo.lead_id.clone(),
            photo_type: Some(photo.photo_type),
            caption: photo.caption.clone(),
            url: None,
            local_photo_id: Some(photo.id),
            pending_upload: !photo.uploaded,
        });
    }

    out
}

fn in_queue_order(pending: &[PendingOperation]) -> Vec<&PendingOperation> {
    let mut ordered: Vec<&PendingOperation> = pending.iter().collect();
    ordered.sort_by_key(|op| op.id);
    ordered
}
