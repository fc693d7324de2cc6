use chrono::{DateTime, Utc};
use fieldsync_proto::PhotoType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A captured photo held on the device until its upload is drained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPhotoRecord {
    pub id: i64,
    pub remote_id: Uuid,
    pub lead_id: String,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub content_hash: String,
    pub caption: Option<String>,
    pub photo_type: PhotoType,
    pub uploaded: bool,
    pub remote_path: Option<String>,
    pub marked_for_deletion: bool,
    pub created_at: DateTime<Utc>,
}

impl LocalPhotoRecord {
    /// Content-addressed path inside the photo bucket
    pub fn storage_path(&self) -> String {
        storage_path_for(&self.lead_id, &self.content_hash)
    }
}

/// Fields supplied at capture time
#[derive(Debug, Clone)]
pub struct NewPhoto {
    pub lead_id: String,
    pub data: Vec<u8>,
    pub caption: Option<String>,
    pub photo_type: PhotoType,
}

impl NewPhoto {
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.data);
        hex::encode(hasher.finalize())
    }
}

pub fn storage_path_for(lead_id: &str, content_hash: &str) -> String {
    format!("{lead_id}/{content_hash}.jpg")
}

/// One entry of a merged photo gallery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoView {
    pub remote_id: String,
    pub lead_id: String,
    pub photo_type: Option<PhotoType>,
    pub caption: Option<String>,
    /// Public URL for uploaded photos
    pub url: Option<String>,
    /// Set while the blob only exists on the device
    pub local_photo_id: Option<i64>,
    pub pending_upload: bool,
}
