use anyhow::Result;
use chrono::Utc;
use fieldsync_proto::PhotoType;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{format_timestamp, parse_timestamp, LocalStore};
use crate::models::{LocalPhotoRecord, NewPhoto};

const PHOTO_COLUMNS: &str = "id, remote_id, lead_id, content_hash, caption, photo_type, \
                             uploaded, remote_path, marked_for_deletion, created_at";

struct PhotoRow {
    id: i64,
    remote_id: String,
    lead_id: String,
    content_hash: String,
    caption: Option<String>,
    photo_type: String,
    uploaded: bool,
    remote_path: Option<String>,
    marked_for_deletion: bool,
    created_at: String,
}

impl PhotoRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            remote_id: row.get(1)?,
            lead_id: row.get(2)?,
            content_hash: row.get(3)?,
            caption: row.get(4)?,
            photo_type: row.get(5)?,
            uploaded: row.get(6)?,
            remote_path: row.get(7)?,
            marked_for_deletion: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_record(self, data: Vec<u8>) -> Result<LocalPhotoRecord> {
        let photo_type: PhotoType = self.photo_type.parse()?;
        Ok(LocalPhotoRecord {
            id: self.id,
            remote_id: Uuid::parse_str(&self.remote_id)?,
            lead_id: self.lead_id,
            data,
            content_hash: self.content_hash,
            caption: self.caption,
            photo_type,
            uploaded: self.uploaded,
            remote_path: self.remote_path,
            marked_for_deletion: self.marked_for_deletion,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

impl LocalStore {
    /// Store a captured photo. The blob stays here until the upload is drained.
    pub fn insert_photo(&self, photo: &NewPhoto) -> Result<LocalPhotoRecord> {
        let remote_id = Uuid::new_v4();
        let content_hash = photo.content_hash();
        let created_at = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO local_photos (remote_id, lead_id, data, content_hash, caption, photo_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                remote_id.to_string(),
                photo.lead_id,
                photo.data,
                content_hash,
                photo.caption,
                photo.photo_type.as_str(),
                format_timestamp(&created_at)
            ],
        )?;
        Ok(LocalPhotoRecord {
            id: conn.last_insert_rowid(),
            remote_id,
            lead_id: photo.lead_id.clone(),
            data: photo.data.clone(),
            content_hash,
            caption: photo.caption.clone(),
            photo_type: photo.photo_type,
            uploaded: false,
            remote_path: None,
            marked_for_deletion: false,
            created_at,
        })
    }

    /// Fetch a photo including its blob
    pub fn get_photo(&self, id: i64) -> Result<Option<LocalPhotoRecord>> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                &format!("SELECT {PHOTO_COLUMNS}, data FROM local_photos WHERE id = ?1"),
                params![id],
                |row| {
                    let photo = PhotoRow::from_row(row)?;
                    let data: Vec<u8> = row.get(10)?;
                    Ok((photo, data))
                },
            )
            .optional()?;
        found.map(|(photo, data)| photo.into_record(data)).transpose()
    }

    /// Photo metadata without blobs, optionally for a single lead
    pub fn list_photos(&self, lead_id: Option<&str>) -> Result<Vec<LocalPhotoRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PHOTO_COLUMNS} FROM local_photos
             WHERE ?1 IS NULL OR lead_id = ?1
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![lead_id], PhotoRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_record(Vec::new())?);
        }
        Ok(out)
    }

    pub fn mark_photo_uploaded(&self, id: i64, remote_path: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE local_photos SET uploaded = 1, remote_path = ?2 WHERE id = ?1",
            params![id, remote_path],
        )?;
        Ok(())
    }

    pub fn set_photo_marked_for_deletion(&self, id: i64, marked: bool) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE local_photos SET marked_for_deletion = ?2 WHERE id = ?1",
            params![id, marked],
        )?;
        Ok(changed > 0)
    }

    /// Drop the local record and its blob
    pub fn purge_photo(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM local_photos WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }
}
