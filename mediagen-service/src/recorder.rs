use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, Client};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, instrument};

use crate::{
    config::{ReferenceRowsConfig, StorageConfig},
    types::{GenerationKind, PendingJob, StoredArtifact},
};

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Reference row rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("Reference row request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Writes a row pointing at a video that finished asynchronously, so the
/// client that started the job can find it.
#[async_trait]
pub trait ReferenceRecorder: Send + Sync {
    async fn record(&self, job: &PendingJob, artifact: &StoredArtifact)
        -> Result<(), RecorderError>;
}

/// Builds the row stored for a completed job.
pub fn reference_row(job: &PendingJob, artifact: &StoredArtifact) -> Value {
    json!({
        "user_id": job.user_id,
        "character_id": job.subject_id,
        "prediction_id": job.job_id,
        "type": GenerationKind::Video.as_str(),
        "storage_path": artifact.storage_path,
        "media_url": artifact.public_url,
        "content_type": artifact.content_type,
    })
}

/// Inserts reference rows through the PostgREST interface of the storage project.
pub struct PostgrestRecorder {
    client: Client,
    url: String,
    service_key: String,
    table: String,
}

impl PostgrestRecorder {
    pub fn new(storage: &StorageConfig, rows: &ReferenceRowsConfig) -> Self {
        Self {
            client: Client::new(),
            url: storage.url.trim().trim_end_matches('/').to_string(),
            service_key: storage.service_key.clone(),
            table: rows.table.clone(),
        }
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.url, self.table)
    }
}

#[async_trait]
impl ReferenceRecorder for PostgrestRecorder {
    #[instrument(level = "info", skip_all, fields(job_id = %job.job_id, table = %self.table))]
    async fn record(
        &self,
        job: &PendingJob,
        artifact: &StoredArtifact,
    ) -> Result<(), RecorderError> {
        let response = self
            .client
            .post(self.table_url())
            .header(AUTHORIZATION, format!("Bearer {}", self.service_key))
            .header("apikey", &self.service_key)
            .header("Prefer", "return=minimal")
            .json(&reference_row(job, artifact))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RecorderError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        info!(
            target = "mediagen-service",
            event = "reference_recorded",
            "Recorded artifact reference row"
        );
        Ok(())
    }
}
