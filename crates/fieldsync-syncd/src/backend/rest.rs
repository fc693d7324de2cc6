use anyhow::{Context, Result};
use async_trait::async_trait;
use fieldsync_proto::MutationKind;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::{BlobUpload, RemoteBackend, RemoteError, TableMutation};
use crate::network::ReachabilityProbe;

/// PostgREST-style backend: rows under `/rest/v1/<table>`, blobs under
/// `/storage/v1/object/<bucket>/<path>`
pub struct RestBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestBackend {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn object_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path)
    }

    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, bucket, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("apikey", key).bearer_auth(key),
            None => request,
        }
    }

    fn request_for(&self, mutation: &TableMutation) -> RequestBuilder {
        let url = self.table_url(&mutation.table);
        let by_id = [("id", format!("eq.{}", mutation.record_id))];
        match mutation.kind {
            // Replays of an insert that already landed are ignored
            MutationKind::Insert => self
                .client
                .post(url)
                .header("Prefer", "resolution=ignore-duplicates,return=minimal")
                .json(&mutation.payload),
            MutationKind::Upsert => self
                .client
                .post(url)
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&mutation.payload),
            MutationKind::Update => self
                .client
                .patch(url)
                .query(&by_id)
                .header("Prefer", "return=minimal")
                .json(&mutation.payload),
            MutationKind::Delete => self.client.delete(url).query(&by_id),
        }
    }
}

/// Map a response status onto the failure taxonomy
pub fn classify_status(status: StatusCode, body: &str) -> Result<(), RemoteError> {
    if status.is_success() {
        return Ok(());
    }
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    match status {
        StatusCode::UNAUTHORIZED
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS => Err(RemoteError::Transient(detail)),
        s if s.is_server_error() => Err(RemoteError::Transient(detail)),
        s if s.is_client_error() => Err(RemoteError::Rejected(detail)),
        _ => Err(RemoteError::Transient(detail)),
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Transient(format!("request timed out: {err}"))
    } else {
        RemoteError::Transient(err.to_string())
    }
}

async fn send(request: RequestBuilder, missing_ok: bool) -> Result<(), RemoteError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if missing_ok && status == StatusCode::NOT_FOUND {
        return Ok(());
    }
    let body = if status.is_success() {
        String::new()
    } else {
        response.text().await.unwrap_or_default()
    };
    classify_status(status, &body)
}

#[async_trait]
impl RemoteBackend for RestBackend {
    async fn apply(&self, mutation: &TableMutation) -> Result<(), RemoteError> {
        debug!(table = %mutation.table, record_id = %mutation.record_id, kind = ?mutation.kind, "applying mutation");
        let request = self.authorize(self.request_for(mutation));
        send(request, mutation.kind == MutationKind::Delete).await
    }

    async fn upload_blob(&self, upload: &BlobUpload) -> Result<String, RemoteError> {
        debug!(bucket = %upload.bucket, path = %upload.path, bytes = upload.bytes.len(), "uploading blob");
        let request = self
            .client
            .post(self.object_url(&upload.bucket, &upload.path))
            .header("Content-Type", upload.content_type.as_str())
            .header("x-upsert", "true")
            .body(upload.bytes.clone());
        send(self.authorize(request), false).await?;
        Ok(self.public_url(&upload.bucket, &upload.path))
    }

    async fn remove_blob(&self, bucket: &str, path: &str) -> Result<(), RemoteError> {
        let request = self.client.delete(self.object_url(bucket, path));
        send(self.authorize(request), true).await
    }
}

#[async_trait]
impl ReachabilityProbe for RestBackend {
    /// Any HTTP answer below 500 means the backend itself is up
    async fn is_reachable(&self) -> bool {
        let request = self.authorize(self.client.get(format!("{}/rest/v1/", self.base_url)));
        match request.send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(_) => false,
        }
    }
}
