use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde_json::Value;
use tracing::{info, instrument};
use url::Url;
use uuid::Uuid;

use crate::{
    error::MediaGenError,
    fetcher::{ArtifactFetcher, FetchError},
    storage::ObjectStorage,
    types::{GenerationKind, ProviderOutput, ProviderResult, StoredArtifact},
};

/// Field of an output object that yields its URL
const URL_ACCESSOR_KEY: &str = "url";

/// Directory video artifacts are nested under
const VIDEO_DIR: &str = "videos";

fn is_http_url(value: &str) -> bool {
    Url::parse(value.trim())
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Decodes a `data:<mime>;base64,<payload>` URI.
fn decode_data_url(value: &str) -> Option<(String, Bytes)> {
    let rest = value.trim().strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    let data = STANDARD.decode(payload.trim()).ok()?;
    Some((mime.to_string(), Bytes::from(data)))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn observed_type(output: &ProviderOutput) -> String {
    match output {
        ProviderOutput::Json(value) => json_type_name(value).to_string(),
        ProviderOutput::Binary { .. } => "binary".to_string(),
        ProviderOutput::List(_) => "list".to_string(),
    }
}

fn resolve_json(
    value: &Value,
    kind: GenerationKind,
    checks: &mut Vec<String>,
) -> Option<ProviderResult> {
    match value {
        Value::String(text) => {
            checks.push("isString".to_string());
            if is_http_url(text) {
                checks.push("isHttpUrl".to_string());
                return Some(ProviderResult::RemoteUrl(text.trim().to_string()));
            }
            let (content_type, data) = decode_data_url(text)?;
            checks.push("isDataUrl".to_string());
            Some(ProviderResult::Immediate {
                data,
                content_type: non_empty_content_type(Some(content_type), kind),
            })
        }
        Value::Array(items) => {
            checks.push("isArray".to_string());
            resolve_json(items.first()?, kind, checks)
        }
        Value::Object(object) => {
            checks.push("isObject".to_string());
            let url = object.get(URL_ACCESSOR_KEY)?;
            checks.push("hasUrlAccessor".to_string());
            resolve_json(url, kind, checks)
        }
        _ => None,
    }
}

fn resolve(
    output: &ProviderOutput,
    kind: GenerationKind,
    checks: &mut Vec<String>,
) -> Option<ProviderResult> {
    match output {
        ProviderOutput::Json(value) => resolve_json(value, kind, checks),
        ProviderOutput::List(items) => {
            checks.push("isArray".to_string());
            resolve(items.first()?, kind, checks)
        }
        ProviderOutput::Binary { data, content_type } => {
            checks.push("isBinary".to_string());
            Some(ProviderResult::Immediate {
                data: data.clone(),
                content_type: non_empty_content_type(content_type.clone(), kind),
            })
        }
    }
}

fn non_empty_content_type(content_type: Option<String>, kind: GenerationKind) -> String {
    content_type
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| kind.default_content_type().to_string())
}

/// Resolves a raw provider output to a result the materializer can store.
///
/// Shapes are tried in a fixed order: an http(s) URL string, the first
/// element of a list, an object's `url` accessor, then raw bytes (including
/// base64 data URIs). Anything else is reported as
/// [`MediaGenError::UnrecognizedOutputShape`] with the checks that matched.
pub fn resolve_output(
    output: &ProviderOutput,
    kind: GenerationKind,
) -> Result<ProviderResult, MediaGenError> {
    let mut checks = Vec::new();
    resolve(output, kind, &mut checks).ok_or_else(|| MediaGenError::UnrecognizedOutputShape {
        observed_type: observed_type(output),
        matched_checks: checks,
    })
}

fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    let lowered = content_type.to_ascii_lowercase();
    if lowered.contains("png") {
        Some("png")
    } else if lowered.contains("webp") {
        Some("webp")
    } else if lowered.contains("jpeg") || lowered.contains("jpg") {
        Some("jpg")
    } else if lowered.contains("mp4") {
        Some("mp4")
    } else if lowered.contains("webm") {
        Some("webm")
    } else {
        None
    }
}

/// Picks the file extension for an artifact.
///
/// The content type wins; otherwise the format the model was asked for, and
/// finally the default of the media kind.
pub fn infer_extension(
    content_type: Option<&str>,
    output_format: Option<&str>,
    kind: GenerationKind,
) -> &'static str {
    content_type
        .and_then(extension_from_content_type)
        .or_else(|| output_format.and_then(extension_from_content_type))
        .unwrap_or_else(|| kind.default_extension())
}

fn content_type_for_extension(extension: &str) -> &'static str {
    match extension {
        "png" => "image/png",
        "webp" => "image/webp",
        "jpg" => "image/jpeg",
        "webm" => "video/webm",
        _ => "video/mp4",
    }
}

/// Storage path of a new artifact: `{user}/{subject}/[videos/]{uuid}.{ext}`
pub fn storage_path(
    kind: GenerationKind,
    user_id: &str,
    subject_id: &str,
    extension: &str,
) -> String {
    let file_name = format!("{}.{extension}", Uuid::new_v4());
    match kind {
        GenerationKind::Image => format!("{user_id}/{subject_id}/{file_name}"),
        GenerationKind::Video => format!("{user_id}/{subject_id}/{VIDEO_DIR}/{file_name}"),
    }
}

/// Turns provider results into stored artifacts.
#[derive(Clone)]
pub struct Materializer {
    storage: Arc<dyn ObjectStorage>,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl Materializer {
    pub fn new(storage: Arc<dyn ObjectStorage>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self { storage, fetcher }
    }

    /// Downloads (when needed) and uploads the media behind `result`.
    ///
    /// Neither the download nor the upload is retried.
    #[instrument(level = "info", skip(self, result))]
    pub async fn materialize(
        &self,
        result: ProviderResult,
        kind: GenerationKind,
        user_id: &str,
        subject_id: &str,
        output_format: Option<&str>,
    ) -> Result<StoredArtifact, MediaGenError> {
        let (data, content_type) = match result {
            ProviderResult::Immediate { data, content_type } => (data, Some(content_type)),
            ProviderResult::RemoteUrl(url) => {
                let fetched = self.fetcher.fetch(&url).await.map_err(|e| match e {
                    FetchError::Status { status, .. } => MediaGenError::ArtifactDownloadFailed {
                        status: Some(status),
                        message: e.to_string(),
                    },
                    FetchError::Transport(_) => MediaGenError::ArtifactDownloadFailed {
                        status: None,
                        message: e.to_string(),
                    },
                })?;
                (fetched.data, fetched.content_type)
            }
            ProviderResult::Pending { job_id } => {
                return Err(MediaGenError::InternalError {
                    message: format!("job {job_id} is still pending, nothing to materialize"),
                });
            }
        };

        let extension = infer_extension(content_type.as_deref(), output_format, kind);
        let content_type = content_type
            .filter(|value| extension_from_content_type(value) == Some(extension))
            .unwrap_or_else(|| content_type_for_extension(extension).to_string());
        let path = storage_path(kind, user_id, subject_id, extension);

        self.storage
            .upload(&path, data, &content_type)
            .await
            .map_err(|e| MediaGenError::StorageUploadFailed {
                path: path.clone(),
                message: e.to_string(),
            })?;
        let public_url = self.storage.public_url(&path);
        info!(
            target = "mediagen-service",
            event = "artifact_materialized",
            path = %path,
            "Materialized generated media"
        );

        Ok(StoredArtifact {
            storage_path: path,
            public_url,
            content_type,
        })
    }
}
