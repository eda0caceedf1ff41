use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

/// The kind of media a generation request produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    #[default]
    Image,
    Video,
}

impl GenerationKind {
    /// File extension used when neither the content type nor the requested
    /// output format names a known one.
    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::Image => "png",
            Self::Video => "mp4",
        }
    }

    /// Content type assumed for binary outputs that do not declare one.
    pub fn default_content_type(&self) -> &'static str {
        match self {
            Self::Image => "image/png",
            Self::Video => "video/mp4",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body accepted by the generation endpoint.
///
/// Every field is optional at the serde level so that missing values are
/// reported as a JSON `400` by the handler instead of an extractor rejection.
#[derive(Debug, Clone, Default, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequestBody {
    /// `image` (default) or `video`
    #[serde(rename = "type")]
    pub kind: Option<GenerationKind>,
    /// The text prompt
    pub prompt: Option<String>,
    /// Source image reference, required for video generations
    pub image: Option<String>,
    /// Opaque identifier of the requesting user
    pub user_id: Option<String>,
    /// Opaque identifier of the character the media belongs to
    pub character_id: Option<String>,
    /// Model parameters, filtered against the model allow-list
    #[schema(value_type = Option<Object>)]
    pub input: Option<Map<String, Value>>,
}

/// A validated generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    pub prompt: String,
    pub user_id: String,
    pub subject_id: String,
    pub image: Option<String>,
    pub raw_parameters: Map<String, Value>,
}

/// Raw output handed back by an inference provider, before shape resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderOutput {
    /// Any JSON value returned in the provider's `output` field
    Json(Value),
    /// A byte buffer, optionally carrying its own content type
    Binary {
        data: Bytes,
        content_type: Option<String>,
    },
    /// Several outputs; only the first one is materialized
    List(Vec<ProviderOutput>),
}

/// A provider result in one of the shapes the materializer understands.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResult {
    Immediate { data: Bytes, content_type: String },
    RemoteUrl(String),
    Pending { job_id: String },
}

/// A media file persisted to object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredArtifact {
    pub storage_path: String,
    pub public_url: String,
    pub content_type: String,
}

/// Metadata needed to route a provider callback back to a storage location.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingJob {
    pub job_id: String,
    pub user_id: String,
    pub subject_id: String,
    pub original_parameters: Map<String, Value>,
}

/// Successful synchronous generation response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(rename = "type")]
    pub kind: GenerationKind,
    /// Storage path of the artifact
    pub path: String,
    /// Public URL of the artifact
    pub url: String,
    /// Wall-clock time spent generating, in milliseconds
    pub generation_time: u64,
    /// Provider model identifier
    pub model: String,
    /// The effective parameters sent to the provider
    #[schema(value_type = Object)]
    pub used: Map<String, Value>,
}

/// Acknowledgment for a generation submitted in webhook mode.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateAcceptedResponse {
    #[serde(rename = "type")]
    pub kind: GenerationKind,
    pub status: String,
    pub prediction_id: String,
}

/// Completion payload posted by the provider to the callback endpoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize, ToSchema)]
pub struct CallbackPayload {
    /// Provider job identifier
    pub id: Option<String>,
    /// Job status, only `succeeded` is materialized
    pub status: Option<String>,
    /// Job output in any of the supported shapes
    #[schema(value_type = Object)]
    #[serde(default)]
    pub output: Value,
    /// The submitted input, echoed back with its `_meta` entry
    #[schema(value_type = Object)]
    #[serde(default)]
    pub input: Value,
}

/// Response of the callback endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    pub ok: bool,
    /// Set when a non-terminal or failed status was acknowledged without work
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction_id: Option<String>,
}
