pub mod replicate;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::{
    error::MediaGenError,
    handlers::metrics::PROVIDER_RETRIES,
    normalizer::NormalizedInput,
    types::{PendingJob, ProviderOutput, ProviderResult},
};

pub use replicate::ReplicateProvider;

/// Input key under which routing metadata is embedded for webhook jobs
pub const META_KEY: &str = "_meta";

/// Metadata key holding the requesting user
pub const META_USER_ID_KEY: &str = "userId";

/// Metadata key holding the subject (character) identifier
pub const META_SUBJECT_ID_KEY: &str = "characterId";

/// Errors reported by an inference provider client
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Provider returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Malformed provider response: {0}")]
    Malformed(String),
    #[error("Prediction {status}: {message}")]
    PredictionFailed { status: String, message: String },
    #[error("Prediction did not finish within {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    /// Whether a retry may succeed where this attempt failed.
    ///
    /// Only an explicit client-side rejection or a prediction that ran and
    /// failed is treated as permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Malformed(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::PredictionFailed { .. } => false,
        }
    }

    fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A third-party inference service.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Runs `model` and waits for its output.
    async fn run(
        &self,
        model: &str,
        input: &Map<String, Value>,
    ) -> Result<ProviderOutput, ProviderError>;

    /// Submits `model` for asynchronous execution, returning the job id.
    /// The provider posts the completed job to `callback_url`.
    async fn submit(
        &self,
        model: &str,
        input: &Map<String, Value>,
        callback_url: &str,
    ) -> Result<String, ProviderError>;
}

/// Bounded retry applied to synchronous provider calls
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Lower bound of the randomized delay between attempts
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    /// Upper bound of the randomized delay between attempts
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_min_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    600
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Randomized delay before the next attempt
    pub fn backoff(&self) -> Duration {
        let low = self.min_backoff_ms.min(self.max_backoff_ms);
        let high = self.min_backoff_ms.max(self.max_backoff_ms);
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }
}

/// Issues provider calls on behalf of the generation handlers.
#[derive(Clone)]
pub struct ProviderInvoker {
    provider: Arc<dyn InferenceProvider>,
    retry: RetryPolicy,
    callback_url: Option<String>,
}

impl ProviderInvoker {
    pub fn new(
        provider: Arc<dyn InferenceProvider>,
        retry: RetryPolicy,
        callback_url: Option<String>,
    ) -> Self {
        Self {
            provider,
            retry,
            callback_url: callback_url.filter(|url| !url.trim().is_empty()),
        }
    }

    /// Runs the model synchronously, retrying transient failures.
    ///
    /// A [`ProviderError::Timeout`] means the prediction exists and may still
    /// be running, so it ends the call instead of starting another one.
    #[instrument(level = "info", skip_all, fields(provider = self.provider.name(), model = %input.model))]
    pub async fn run(&self, input: &NormalizedInput) -> Result<ProviderOutput, MediaGenError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.provider.run(&input.model, &input.input).await {
                Ok(output) => return Ok(output),
                Err(e) if !e.is_transient() => {
                    return Err(MediaGenError::ProviderRejected {
                        status: e.upstream_status(),
                        message: e.to_string(),
                    });
                }
                Err(e @ ProviderError::Timeout(_)) => {
                    return Err(MediaGenError::ProviderUnavailable {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) if attempt >= max_attempts => {
                    return Err(MediaGenError::ProviderUnavailable {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.retry.backoff();
                    warn!(
                        target = "mediagen-service",
                        event = "provider_retry",
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient provider failure, retrying"
                    );
                    PROVIDER_RETRIES.add(1, &[KeyValue::new("model", input.model.clone())]);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Submits the model in webhook mode and returns a pending result.
    ///
    /// The routing metadata travels inside the provider input and is echoed
    /// back verbatim on completion.
    #[instrument(level = "info", skip_all, fields(provider = self.provider.name(), model = %input.model))]
    pub async fn submit(
        &self,
        input: &NormalizedInput,
        user_id: &str,
        subject_id: &str,
    ) -> Result<(ProviderResult, PendingJob), MediaGenError> {
        let callback_url =
            self.callback_url
                .as_deref()
                .ok_or_else(|| MediaGenError::MisconfiguredCallback {
                    message: "webhook mode requires a callback_url".to_string(),
                })?;

        let mut submitted = input.input.clone();
        submitted.insert(
            META_KEY.to_string(),
            json!({
                META_USER_ID_KEY: user_id,
                META_SUBJECT_ID_KEY: subject_id,
            }),
        );

        let job_id = self
            .provider
            .submit(&input.model, &submitted, callback_url)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    MediaGenError::ProviderUnavailable {
                        attempts: 1,
                        message: e.to_string(),
                    }
                } else {
                    MediaGenError::ProviderRejected {
                        status: e.upstream_status(),
                        message: e.to_string(),
                    }
                }
            })?;
        info!(
            target = "mediagen-service",
            event = "job_submitted",
            job_id = %job_id,
            "Submitted generation job"
        );

        let pending = PendingJob {
            job_id: job_id.clone(),
            user_id: user_id.to_string(),
            subject_id: subject_id.to_string(),
            original_parameters: input.input.clone(),
        };
        Ok((ProviderResult::Pending { job_id }, pending))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::types::GenerationKind;

    /// Scripted provider; each call pops the next queued response.
    #[derive(Default)]
    pub(crate) struct ScriptedProvider {
        pub(crate) runs: Mutex<Vec<Result<ProviderOutput, ProviderError>>>,
        pub(crate) run_calls: Mutex<u32>,
        pub(crate) submissions: Mutex<Vec<(String, Map<String, Value>, String)>>,
    }

    impl ScriptedProvider {
        pub(crate) fn with_runs(runs: Vec<Result<ProviderOutput, ProviderError>>) -> Self {
            let mut runs = runs;
            runs.reverse();
            Self {
                runs: Mutex::new(runs),
                ..Default::default()
            }
        }

        pub(crate) fn run_calls(&self) -> u32 {
            *self.run_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl InferenceProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run(
            &self,
            _model: &str,
            _input: &Map<String, Value>,
        ) -> Result<ProviderOutput, ProviderError> {
            *self.run_calls.lock().unwrap() += 1;
            self.runs
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ProviderError::Transport("script exhausted".into())))
        }

        async fn submit(
            &self,
            model: &str,
            input: &Map<String, Value>,
            callback_url: &str,
        ) -> Result<String, ProviderError> {
            self.submissions.lock().unwrap().push((
                model.to_string(),
                input.clone(),
                callback_url.to_string(),
            ));
            Ok("job-1".to_string())
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            min_backoff_ms: 0,
            max_backoff_ms: 1,
        }
    }

    fn input() -> NormalizedInput {
        let mut input = Map::new();
        input.insert("prompt".into(), json!("a cat"));
        NormalizedInput {
            model: "acme/model".into(),
            kind: GenerationKind::Image,
            input,
        }
    }

    #[tokio::test]
    async fn two_transient_failures_make_exactly_two_attempts() {
        let provider = Arc::new(ScriptedProvider::with_runs(vec![
            Err(ProviderError::Transport("connection reset".into())),
            Err(ProviderError::Status {
                status: 503,
                message: "busy".into(),
            }),
            Ok(ProviderOutput::Json(json!("https://cdn/out.png"))),
        ]));
        let invoker = ProviderInvoker::new(provider.clone(), fast_retry(), None);

        let err = invoker.run(&input()).await.unwrap_err();
        assert!(matches!(
            err,
            MediaGenError::ProviderUnavailable { attempts: 2, .. }
        ));
        assert_eq!(provider.run_calls(), 2);
    }

    #[tokio::test]
    async fn transient_failure_then_success_returns_output() {
        let provider = Arc::new(ScriptedProvider::with_runs(vec![
            Err(ProviderError::Malformed("truncated".into())),
            Ok(ProviderOutput::Json(json!("https://cdn/out.png"))),
        ]));
        let invoker = ProviderInvoker::new(provider.clone(), fast_retry(), None);

        let output = invoker.run(&input()).await.unwrap();
        assert_eq!(output, ProviderOutput::Json(json!("https://cdn/out.png")));
        assert_eq!(provider.run_calls(), 2);
    }

    #[tokio::test]
    async fn permanent_rejection_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::with_runs(vec![Err(
            ProviderError::Status {
                status: 422,
                message: "invalid input".into(),
            },
        )]));
        let invoker = ProviderInvoker::new(provider.clone(), fast_retry(), None);

        let err = invoker.run(&input()).await.unwrap_err();
        assert!(matches!(
            err,
            MediaGenError::ProviderRejected {
                status: Some(422),
                ..
            }
        ));
        assert_eq!(provider.run_calls(), 1);
    }

    #[tokio::test]
    async fn timed_out_prediction_is_not_run_again() {
        let provider = Arc::new(ScriptedProvider::with_runs(vec![
            Err(ProviderError::Timeout(Duration::from_secs(300))),
            Ok(ProviderOutput::Json(json!("https://cdn/out.png"))),
        ]));
        let invoker = ProviderInvoker::new(provider.clone(), fast_retry(), None);

        let err = invoker.run(&input()).await.unwrap_err();
        assert!(matches!(
            err,
            MediaGenError::ProviderUnavailable { attempts: 1, .. }
        ));
        assert_eq!(provider.run_calls(), 1);
    }

    #[tokio::test]
    async fn submit_without_callback_url_fails_before_submission() {
        let provider = Arc::new(ScriptedProvider::default());
        let invoker = ProviderInvoker::new(provider.clone(), fast_retry(), Some("  ".into()));

        let err = invoker.submit(&input(), "u1", "c1").await.unwrap_err();
        assert!(matches!(err, MediaGenError::MisconfiguredCallback { .. }));
        assert!(provider.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_embeds_routing_metadata() {
        let provider = Arc::new(ScriptedProvider::default());
        let invoker = ProviderInvoker::new(
            provider.clone(),
            fast_retry(),
            Some("https://svc/api/generate/callback".into()),
        );

        let (result, pending) = invoker.submit(&input(), "u1", "c1").await.unwrap();
        assert_eq!(
            result,
            ProviderResult::Pending {
                job_id: "job-1".into()
            }
        );
        assert_eq!(pending.user_id, "u1");
        assert!(!pending.original_parameters.contains_key(META_KEY));

        let submissions = provider.submissions.lock().unwrap();
        let (_, submitted, callback_url) = &submissions[0];
        assert_eq!(callback_url, "https://svc/api/generate/callback");
        assert_eq!(submitted[META_KEY]["userId"], "u1");
        assert_eq!(submitted[META_KEY]["characterId"], "c1");
    }

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Status {
            status: 429,
            message: String::new()
        }
        .is_transient());
        assert!(!ProviderError::Status {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(!ProviderError::PredictionFailed {
            status: "failed".into(),
            message: String::new()
        }
        .is_transient());
    }

    #[test]
    fn backoff_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.backoff().as_millis() as u64;
            assert!((200..=600).contains(&delay));
        }
    }
}
