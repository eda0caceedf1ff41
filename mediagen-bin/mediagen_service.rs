use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use mediagen_service::{
    config::MediaGenConfig,
    fetcher::HttpFetcher,
    gate::GenerationGate,
    materializer::Materializer,
    models::ModelCatalog,
    provider::{ProviderInvoker, ReplicateProvider},
    recorder::{PostgrestRecorder, ReferenceRecorder},
    server::{run_server, AppState},
    storage::SupabaseStorage,
    types::GenerationKind,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_appender::{
    non_blocking,
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::UtcTime},
    prelude::*,
    EnvFilter, Registry,
};

/// The directory where the logs are stored.
const LOGS: &str = "./logs";
/// The log file name.
const LOG_FILE: &str = "mediagen-service.log";
/// Fallback environment variable for the provider token
const PROVIDER_TOKEN_ENV: &str = "REPLICATE_API_TOKEN";
/// Fallback environment variable for the storage service key
const STORAGE_KEY_ENV: &str = "SUPABASE_SERVICE_KEY";

/// Command line arguments for the MediaGen service
#[derive(Parser)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config_path: String,
}

/// Fills an empty secret from the environment.
fn secret_or_env(value: &mut String, var: &str) {
    if value.trim().is_empty() {
        if let Ok(from_env) = std::env::var(var) {
            *value = from_env;
        }
    }
}

/// Configures logging with a pretty console layer and a daily rolling JSON
/// file layer. The returned guard flushes the file writer when dropped.
fn setup_logging<P: AsRef<Path>>(log_dir: P) -> WorkerGuard {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_appender);

    let console_layer = fmt::layer()
        .pretty()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_span_events(FmtSpan::ENTER);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mediagen_service=debug"));

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

/// Checks that both configured models have an input contract.
fn check_models(catalog: &ModelCatalog, config: &MediaGenConfig) -> Result<()> {
    for (kind, model) in [
        (GenerationKind::Image, &config.image_model),
        (GenerationKind::Video, &config.video_model),
    ] {
        if catalog.get(kind, model).is_none() {
            anyhow::bail!(
                "no input contract for {kind} model `{model}`, known models: {}",
                catalog.models(kind).join(", ")
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = setup_logging(LOGS);
    let args = Args::parse();

    let mut config = MediaGenConfig::from_file_path(&args.config_path)
        .with_context(|| format!("Failed to load configuration from {}", args.config_path))?;
    secret_or_env(&mut config.provider.api_token, PROVIDER_TOKEN_ENV);
    secret_or_env(&mut config.storage.service_key, STORAGE_KEY_ENV);

    let catalog = ModelCatalog::builtin().with_overrides(config.models.clone());
    check_models(&catalog, &config)?;

    let provider = ReplicateProvider::new(&config.provider)
        .context("Failed to build the inference provider client")?;
    let fetcher = HttpFetcher::new(
        reqwest::Client::builder()
            .timeout(Duration::from_millis(config.provider.request_timeout_ms))
            .build()
            .context("Failed to build the download client")?,
    );
    let storage = SupabaseStorage::new(&config.storage);
    let recorder = config.reference_rows.as_ref().map(|rows| {
        Arc::new(PostgrestRecorder::new(&config.storage, rows)) as Arc<dyn ReferenceRecorder>
    });

    if config.callback_url.is_none() {
        warn!(
            target = "mediagen-service",
            event = "callback_url_missing",
            video_mode = ?config.video_mode,
            "No callback_url configured, webhook video generations will be rejected"
        );
    }

    let app_state = AppState {
        invoker: ProviderInvoker::new(
            Arc::new(provider),
            config.retry.clone(),
            config.callback_url.clone(),
        ),
        materializer: Materializer::new(Arc::new(storage), Arc::new(fetcher)),
        catalog: Arc::new(catalog),
        image_model: config.image_model.clone(),
        video_model: config.video_model.clone(),
        video_mode: config.video_mode,
        gate: GenerationGate::new(config.max_concurrent_generations),
        recorder,
        reference_row_policy: config.reference_row_policy,
        max_body_bytes: config.max_body_bytes,
    };

    let tcp_listener = TcpListener::bind(&config.service_bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.service_bind_address))?;
    info!(
        target = "mediagen-service",
        event = "server_started",
        address = %config.service_bind_address,
        image_model = %config.image_model,
        video_model = %config.video_model,
        "Starting MediaGen service"
    );

    run_server(app_state, tcp_listener).await
}
