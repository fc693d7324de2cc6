//! The authoritative backend as seen by the sync engine.
//!
//! Every call must be safe to repeat: the engine replays an operation whenever
//! it cannot tell whether the previous attempt landed.

pub mod memory;
pub mod rest;

use async_trait::async_trait;
use fieldsync_core::storage::snapshots::Record;
use fieldsync_proto::MutationKind;
use serde::Serialize;
use thiserror::Error;

pub use memory::MemoryBackend;
pub use rest::RestBackend;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableMutation {
    pub table: String,
    pub record_id: String,
    pub kind: MutationKind,
    pub payload: Record,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobUpload {
    pub bucket: String,
    pub path: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network trouble, timeouts, overload. Worth another attempt.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The backend refused the payload. Retrying the same payload cannot succeed.
    #[error("rejected by backend: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Apply an insert/update/upsert/delete to one record
    async fn apply(&self, mutation: &TableMutation) -> Result<(), RemoteError>;

    /// Store a blob and return its public reference
    async fn upload_blob(&self, upload: &BlobUpload) -> Result<String, RemoteError>;

    /// Remove a blob. Removing a missing blob succeeds.
    async fn remove_blob(&self, bucket: &str, path: &str) -> Result<(), RemoteError>;
}
