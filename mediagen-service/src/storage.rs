use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    Client,
};
use thiserror::Error;
use tracing::{info, instrument};

use crate::config::StorageConfig;

/// Header controlling whether an existing object may be overwritten
const UPSERT_HEADER: &str = "x-upsert";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage rejected the upload with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("Storage request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Object store the generated media is persisted to.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Writes `data` at `path`. Paths are never overwritten.
    async fn upload(&self, path: &str, data: Bytes, content_type: &str)
        -> Result<(), StorageError>;

    /// Stable public URL of the object at `path`
    fn public_url(&self, path: &str) -> String;
}

/// Supabase Storage backend.
pub struct SupabaseStorage {
    client: Client,
    url: String,
    service_key: String,
    bucket: String,
}

impl SupabaseStorage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            client: Client::new(),
            url: config.url.trim().trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            bucket: config.bucket.clone(),
        }
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.url, self.bucket, path)
    }
}

#[async_trait]
impl ObjectStorage for SupabaseStorage {
    #[instrument(level = "info", skip(self, data), fields(size = data.len()))]
    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .client
            .post(self.object_url(path))
            .header(AUTHORIZATION, format!("Bearer {}", self.service_key))
            .header("apikey", &self.service_key)
            .header(CONTENT_TYPE, content_type)
            .header(UPSERT_HEADER, "false")
            .body(data)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        info!(
            target = "mediagen-service",
            event = "artifact_uploaded",
            path,
            "Uploaded artifact to storage"
        );
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.url, self.bucket, path
        )
    }
}
