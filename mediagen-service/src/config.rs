use std::path::Path;

use config::{Config, ConfigError, File};
use serde::Deserialize;

use crate::{models::ModelInputSpec, provider::RetryPolicy};

/// Default base URL of the predictions API
const DEFAULT_PROVIDER_API_BASE: &str = "https://api.replicate.com/v1";

/// Default cap on request bodies; provider callbacks may inline media as data URLs
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// How video generations reach the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoMode {
    /// Wait for the provider and answer with the stored video
    Sync,
    /// Submit with a callback URL and answer `202` immediately
    #[default]
    Webhook,
}

/// What to do when the reference row for a materialized video cannot be written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceRowPolicy {
    /// Fail the callback with a `500`
    #[default]
    Propagate,
    /// Log the failure and acknowledge the callback anyway
    Swallow,
}

/// Connection settings for the inference provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the predictions API
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Bearer token used for every provider call
    #[serde(default)]
    pub api_token: String,

    /// Timeout applied to each individual HTTP request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Delay between two polls of a running prediction
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Overall time a synchronous prediction may take before giving up
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Seconds the provider is asked to hold the create call open
    #[serde(default = "default_wait_seconds")]
    pub wait_seconds: u64,
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_api_base() -> String {
    DEFAULT_PROVIDER_API_BASE.to_string()
}

fn default_request_timeout_ms() -> u64 {
    90_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_poll_timeout_ms() -> u64 {
    300_000
}

fn default_wait_seconds() -> u64 {
    60
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_token: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            wait_seconds: default_wait_seconds(),
        }
    }
}

/// Object storage settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base URL of the storage project
    pub url: String,

    /// Service key used to authorize uploads
    #[serde(default)]
    pub service_key: String,

    /// Bucket generated media is written to
    pub bucket: String,
}

/// Target table for artifact reference rows.
#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceRowsConfig {
    /// PostgREST table name, e.g. `chat_messages`
    pub table: String,
}

/// Configuration for the MediaGen service.
///
/// Loaded from the `media_gen` section of a configuration file, with every
/// value overridable through `MEDIA_GEN__*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaGenConfig {
    /// Bind address for the HTTP server.
    pub service_bind_address: String,

    /// Provider model used for image requests.
    pub image_model: String,

    /// Provider model used for video requests.
    pub video_model: String,

    /// Whether video generations wait for the provider or use the webhook.
    #[serde(default)]
    pub video_mode: VideoMode,

    /// Public URL of the callback endpoint, required in webhook mode.
    #[serde(default)]
    pub callback_url: Option<String>,

    /// Maximum number of generations running at once in this process.
    ///
    /// Unset means unbounded. The gate is process-local and does not
    /// coordinate across instances.
    #[serde(default)]
    pub max_concurrent_generations: Option<usize>,

    /// Largest request body accepted by the generation and callback routes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Failure policy for the reference row written after a video callback.
    #[serde(default)]
    pub reference_row_policy: ReferenceRowPolicy,

    /// Retry settings for synchronous provider calls.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Inference provider settings.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Object storage settings.
    pub storage: StorageConfig,

    /// Reference row table; no rows are written when absent.
    #[serde(default)]
    pub reference_rows: Option<ReferenceRowsConfig>,

    /// Additional or replacement model input contracts.
    #[serde(default)]
    pub models: Vec<ModelInputSpec>,
}

impl MediaGenConfig {
    /// Creates a new `MediaGenConfig` instance from a configuration file.
    ///
    /// # Arguments
    ///
    /// * `config_file_path` - Path to the configuration file. The file should be in a format
    ///   supported by the `config` crate (e.g., YAML, JSON, TOML) and contain a "media_gen"
    ///   section with the required configuration fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the "media_gen"
    /// section does not match the expected structure.
    pub fn from_file_path<P: AsRef<Path>>(config_file_path: P) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(config_file_path.as_ref()))
            .add_source(
                config::Environment::with_prefix("MEDIA_GEN")
                    .keep_prefix(true)
                    .separator("__"),
            );
        builder.build()?.get::<Self>("media_gen")
    }
}
