use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::CONTENT_TYPE, Client};
use thiserror::Error;
use tracing::instrument;

/// Media downloaded from a provider URL
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedArtifact {
    pub data: Bytes,
    pub content_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Download of {url} returned status {status}")]
    Status { status: u16, url: String },
    #[error("Download failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Downloads generated media referenced by URL.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedArtifact, FetchError>;
}

/// Plain HTTP GET fetcher.
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    #[instrument(level = "info", skip(self))]
    async fn fetch(&self, url: &str) -> Result<FetchedArtifact, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let data = response.bytes().await?;
        Ok(FetchedArtifact { data, content_type })
    }
}
