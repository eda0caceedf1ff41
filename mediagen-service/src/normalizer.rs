use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::{
    error::MediaGenError,
    models::ModelInputSpec,
    types::{GenerateRequestBody, GenerationKind, GenerationRequest},
};

/// Field used for the start image when a video model does not name one
const DEFAULT_IMAGE_FIELD: &str = "image";

/// Provider input produced for a single request.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedInput {
    pub model: String,
    pub kind: GenerationKind,
    pub input: Map<String, Value>,
}

fn required(value: Option<String>, field: &str) -> Result<String, MediaGenError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(MediaGenError::InvalidRequest {
            message: format!("{field} is required"),
        }),
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

impl TryFrom<GenerateRequestBody> for GenerationRequest {
    type Error = MediaGenError;

    fn try_from(body: GenerateRequestBody) -> Result<Self, Self::Error> {
        Ok(Self {
            kind: body.kind.unwrap_or_default(),
            prompt: required(body.prompt, "prompt")?,
            user_id: required(body.user_id, "userId")?,
            subject_id: required(body.character_id, "characterId")?,
            image: body.image,
            raw_parameters: body.input.unwrap_or_default(),
        })
    }
}

/// Builds the provider input for `request` from the model's input contract.
///
/// Legacy names are renamed first (a non-null current name wins when both
/// are supplied), then anything outside the allow-list or set to `null` is
/// dropped, the remainder is merged over the model defaults, and finally the
/// prompt and, for video, the start image are written on top.
#[instrument(level = "debug", skip_all, fields(model = %spec.model, kind = %request.kind))]
pub fn normalize(
    request: &GenerationRequest,
    spec: &ModelInputSpec,
) -> Result<NormalizedInput, MediaGenError> {
    required(Some(request.prompt.clone()), "prompt")?;
    required(Some(request.user_id.clone()), "userId")?;
    required(Some(request.subject_id.clone()), "characterId")?;

    let mut input = spec.defaults.clone();
    let mut dropped = Vec::new();
    for (key, value) in &request.raw_parameters {
        let name = match spec.aliases.get(key) {
            Some(current)
                if request
                    .raw_parameters
                    .get(current)
                    .is_some_and(|value| !value.is_null()) =>
            {
                dropped.push(key.as_str());
                continue;
            }
            Some(current) => current.as_str(),
            None => key.as_str(),
        };
        if !spec.is_permitted(name) || value.is_null() {
            dropped.push(key.as_str());
            continue;
        }
        input.insert(name.to_string(), value.clone());
    }
    if !dropped.is_empty() {
        debug!(dropped = ?dropped, "Dropped parameters outside the model allow-list");
    }

    if request.kind == GenerationKind::Video {
        let field = spec.image_field.as_deref().unwrap_or(DEFAULT_IMAGE_FIELD);
        let image = non_blank(request.image.as_deref())
            .map(str::to_string)
            .or_else(|| non_blank(input.get(field).and_then(Value::as_str)).map(str::to_string))
            .ok_or_else(|| MediaGenError::InvalidRequest {
                message: "image is required for video generation".to_string(),
            })?;
        input.insert(field.to_string(), Value::String(image));
    }
    input.insert(
        spec.prompt_field.clone(),
        Value::String(request.prompt.clone()),
    );

    Ok(NormalizedInput {
        model: spec.model.clone(),
        kind: request.kind,
        input,
    })
}
