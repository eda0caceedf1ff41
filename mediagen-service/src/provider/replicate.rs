use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{header::HeaderValue, Client, Response};
use serde_json::{json, Map, Value};
use tracing::{debug, instrument, warn};

use super::{InferenceProvider, ProviderError};
use crate::{config::ProviderConfig, types::ProviderOutput};

/// Header asking the API to hold the connection open until the prediction ends
const PREFER_HEADER: &str = "Prefer";

/// Longest body excerpt kept in error messages
const MAX_ERROR_BODY_LEN: usize = 512;

/// Events the provider should report to the webhook
const WEBHOOK_EVENTS: [&str; 1] = ["completed"];

/// Where a prediction stands after a create or poll call
#[derive(Debug, PartialEq)]
enum PredictionState {
    Succeeded(Value),
    Running { poll_url: String },
    Failed { status: String, message: String },
}

/// Client for a Replicate-compatible predictions API.
pub struct ReplicateProvider {
    api_base: String,
    api_token: String,
    client: Client,
    poll_interval: Duration,
    poll_timeout: Duration,
    wait_seconds: u64,
}

impl ReplicateProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            api_base: config.api_base.trim().trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            client,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            wait_seconds: config.wait_seconds,
        })
    }

    /// Resolves the endpoint and the version for a model identifier.
    ///
    /// `owner/name:version` targets the version-pinned predictions endpoint,
    /// a bare `owner/name` targets the official-model endpoint.
    fn endpoint_for_model(&self, model: &str) -> (String, Option<String>) {
        match model.split_once(':') {
            Some((_, version)) if !version.is_empty() => {
                (format!("{}/predictions", self.api_base), Some(version.to_string()))
            }
            _ => (
                format!("{}/models/{}/predictions", self.api_base, model.trim()),
                None,
            ),
        }
    }

    fn prediction_body(
        version: Option<String>,
        input: &Map<String, Value>,
        callback_url: Option<&str>,
    ) -> Value {
        let mut body = json!({ "input": input });
        if let Some(version) = version {
            body["version"] = Value::String(version);
        }
        if let Some(callback_url) = callback_url {
            body["webhook"] = Value::String(callback_url.to_string());
            body["webhook_events_filter"] = json!(WEBHOOK_EVENTS);
        }
        body
    }

    async fn post_prediction(
        &self,
        model: &str,
        body: &Value,
        wait: bool,
    ) -> Result<Value, ProviderError> {
        let (endpoint, _) = self.endpoint_for_model(model);
        let mut request = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_token)
            .json(body);
        if wait {
            let prefer = HeaderValue::from_str(&format!("wait={}", self.wait_seconds))
                .unwrap_or_else(|_| HeaderValue::from_static("wait"));
            request = request.header(PREFER_HEADER, prefer);
        }
        let response = request.send().await.map_err(classify_send_error)?;
        response_json(response).await
    }

    async fn get_prediction(&self, poll_url: &str) -> Result<Value, ProviderError> {
        let response = self
            .client
            .get(poll_url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(classify_send_error)?;
        response_json(response).await
    }

    /// Polls an existing prediction until it leaves the running states.
    ///
    /// Transient poll failures are polled through until the poll timeout; the
    /// prediction itself is never recreated from here.
    async fn poll_prediction(&self, mut poll_url: String) -> Result<Value, ProviderError> {
        let started = Instant::now();
        loop {
            if started.elapsed() >= self.poll_timeout {
                return Err(ProviderError::Timeout(self.poll_timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
            let prediction = match self.get_prediction(&poll_url).await {
                Ok(prediction) => prediction,
                Err(e) if e.is_transient() => {
                    warn!(
                        target = "mediagen-service",
                        event = "prediction_poll_failed",
                        poll_url = %poll_url,
                        error = %e,
                        "Transient poll failure, polling again"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            match prediction_state(&prediction)? {
                PredictionState::Running { poll_url: next } => {
                    debug!(poll_url = %next, "Prediction still running");
                    poll_url = next;
                }
                _ => return Ok(prediction),
            }
        }
    }
}

#[async_trait]
impl InferenceProvider for ReplicateProvider {
    fn name(&self) -> &str {
        "replicate"
    }

    #[instrument(level = "info", skip(self, input))]
    async fn run(
        &self,
        model: &str,
        input: &Map<String, Value>,
    ) -> Result<ProviderOutput, ProviderError> {
        let (_, version) = self.endpoint_for_model(model);
        let body = Self::prediction_body(version, input, None);
        let mut prediction = self.post_prediction(model, &body, true).await?;
        if let PredictionState::Running { poll_url } = prediction_state(&prediction)? {
            prediction = self.poll_prediction(poll_url).await?;
        }
        match prediction_state(&prediction)? {
            PredictionState::Succeeded(output) => Ok(ProviderOutput::Json(output)),
            PredictionState::Failed { status, message } => {
                Err(ProviderError::PredictionFailed { status, message })
            }
            PredictionState::Running { .. } => Err(ProviderError::Timeout(self.poll_timeout)),
        }
    }

    #[instrument(level = "info", skip(self, input))]
    async fn submit(
        &self,
        model: &str,
        input: &Map<String, Value>,
        callback_url: &str,
    ) -> Result<String, ProviderError> {
        let (_, version) = self.endpoint_for_model(model);
        let body = Self::prediction_body(version, input, Some(callback_url));
        let prediction = self.post_prediction(model, &body, false).await?;
        prediction
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Malformed("prediction response has no id".to_string()))
    }
}

fn classify_send_error(error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        return ProviderError::Transport(format!("request timed out: {error}"));
    }
    ProviderError::Transport(error.to_string())
}

fn truncate(text: &str) -> String {
    text.chars().take(MAX_ERROR_BODY_LEN).collect()
}

async fn response_json(response: Response) -> Result<Value, ProviderError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ProviderError::Malformed(format!("failed reading response body: {e}")))?;
    if !status.is_success() {
        return Err(ProviderError::Status {
            status: status.as_u16(),
            message: truncate(&body),
        });
    }
    serde_json::from_str(&body)
        .map_err(|e| ProviderError::Malformed(format!("{e}: {}", truncate(&body))))
}

fn prediction_state(prediction: &Value) -> Result<PredictionState, ProviderError> {
    let status = prediction
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| ProviderError::Malformed("prediction has no status".to_string()))?;
    match status.as_str() {
        "succeeded" => Ok(PredictionState::Succeeded(
            prediction.get("output").cloned().unwrap_or(Value::Null),
        )),
        "starting" | "processing" => {
            let poll_url = prediction
                .get("urls")
                .and_then(|urls| urls.get("get"))
                .and_then(Value::as_str)
                .filter(|url| !url.trim().is_empty())
                .ok_or_else(|| ProviderError::Malformed("prediction has no poll URL".to_string()))?;
            Ok(PredictionState::Running {
                poll_url: poll_url.to_string(),
            })
        }
        _ => Ok(PredictionState::Failed {
            message: prediction
                .get("error")
                .map(|error| match error {
                    Value::String(message) => message.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default(),
            status,
        }),
    }
}
