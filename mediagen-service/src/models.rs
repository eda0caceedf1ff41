use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::types::GenerationKind;

/// The default field carrying the prompt in a provider input
const DEFAULT_PROMPT_FIELD: &str = "prompt";

/// Input contract of one provider model.
///
/// Describes which caller parameters the model accepts, how legacy parameter
/// names map onto current ones and which defaults are always sent. Entries are
/// deploy-time data: they are loaded once and never mutated.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ModelInputSpec {
    /// Provider model identifier, e.g. `owner/name` or `owner/name:version`
    pub model: String,
    /// The media kind this model produces
    pub kind: GenerationKind,
    /// Parameter names the model accepts
    #[serde(default)]
    pub permitted: BTreeSet<String>,
    /// Legacy name to current name
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Values sent when the caller does not override them
    #[serde(default)]
    pub defaults: Map<String, Value>,
    /// Field the prompt is written to
    #[serde(default = "default_prompt_field")]
    pub prompt_field: String,
    /// Field the start image is written to, for image-to-video models
    #[serde(default)]
    pub image_field: Option<String>,
}

fn default_prompt_field() -> String {
    DEFAULT_PROMPT_FIELD.to_string()
}

impl ModelInputSpec {
    fn new(model: &str, kind: GenerationKind) -> Self {
        Self {
            model: model.to_string(),
            kind,
            permitted: BTreeSet::new(),
            aliases: BTreeMap::new(),
            defaults: Map::new(),
            prompt_field: default_prompt_field(),
            image_field: None,
        }
    }

    fn permit(mut self, names: &[&str]) -> Self {
        self.permitted
            .extend(names.iter().map(|name| name.to_string()));
        self
    }

    fn alias(mut self, legacy: &str, current: &str) -> Self {
        self.aliases
            .insert(legacy.to_string(), current.to_string());
        self
    }

    fn defaults(mut self, defaults: Value) -> Self {
        if let Value::Object(map) = defaults {
            self.defaults = map;
        }
        self
    }

    fn image_field(mut self, field: &str) -> Self {
        self.image_field = Some(field.to_string());
        self
    }

    /// Whether `name` may be forwarded to the provider
    pub fn is_permitted(&self, name: &str) -> bool {
        self.permitted.contains(name)
    }
}

/// Lookup table of every supported (kind, model) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCatalog {
    specs: Vec<ModelInputSpec>,
}

impl ModelCatalog {
    pub fn new(specs: Vec<ModelInputSpec>) -> Self {
        Self { specs }
    }

    /// The models shipped with the service.
    pub fn builtin() -> Self {
        Self::new(vec![
            ModelInputSpec::new("black-forest-labs/flux-dev", GenerationKind::Image)
                .permit(&[
                    "aspect_ratio",
                    "num_outputs",
                    "num_inference_steps",
                    "guidance",
                    "seed",
                    "output_format",
                    "output_quality",
                    "prompt_strength",
                    "go_fast",
                    "megapixels",
                    "disable_safety_checker",
                ])
                .alias("guidance_scale", "guidance")
                .alias("steps", "num_inference_steps")
                .alias("format", "output_format")
                .defaults(json!({
                    "aspect_ratio": "1:1",
                    "num_outputs": 1,
                    "output_format": "webp",
                    "output_quality": 90,
                })),
            ModelInputSpec::new("black-forest-labs/flux-schnell", GenerationKind::Image)
                .permit(&[
                    "aspect_ratio",
                    "num_outputs",
                    "num_inference_steps",
                    "seed",
                    "output_format",
                    "output_quality",
                    "go_fast",
                    "megapixels",
                    "disable_safety_checker",
                ])
                .alias("steps", "num_inference_steps")
                .alias("format", "output_format")
                .defaults(json!({
                    "aspect_ratio": "1:1",
                    "num_outputs": 1,
                    "num_inference_steps": 4,
                    "output_format": "webp",
                })),
            ModelInputSpec::new("stability-ai/sdxl", GenerationKind::Image)
                .permit(&[
                    "width",
                    "height",
                    "negative_prompt",
                    "num_outputs",
                    "scheduler",
                    "num_inference_steps",
                    "guidance_scale",
                    "prompt_strength",
                    "refine",
                    "high_noise_frac",
                    "seed",
                    "apply_watermark",
                    "disable_safety_checker",
                ])
                .alias("guidance", "guidance_scale")
                .alias("steps", "num_inference_steps")
                .alias("negativePrompt", "negative_prompt")
                .defaults(json!({
                    "width": 1024,
                    "height": 1024,
                    "num_outputs": 1,
                    "num_inference_steps": 30,
                    "guidance_scale": 7.5,
                    "apply_watermark": false,
                })),
            ModelInputSpec::new("wavespeedai/wan-2.1-i2v-480p", GenerationKind::Video)
                .permit(&[
                    "image",
                    "num_frames",
                    "frames_per_second",
                    "sample_steps",
                    "sample_guide_scale",
                    "sample_shift",
                    "fast_mode",
                    "aspect_ratio",
                    "seed",
                ])
                .alias("start_image", "image")
                .alias("fps", "frames_per_second")
                .alias("steps", "sample_steps")
                .alias("guidance_scale", "sample_guide_scale")
                .image_field("image")
                .defaults(json!({
                    "num_frames": 81,
                    "frames_per_second": 16,
                    "fast_mode": "Balanced",
                })),
            ModelInputSpec::new("kwaivgi/kling-v1.6-standard", GenerationKind::Video)
                .permit(&[
                    "start_image",
                    "duration",
                    "cfg_scale",
                    "aspect_ratio",
                    "negative_prompt",
                ])
                .alias("image", "start_image")
                .alias("guidance_scale", "cfg_scale")
                .alias("negativePrompt", "negative_prompt")
                .image_field("start_image")
                .defaults(json!({
                    "duration": 5,
                    "cfg_scale": 0.5,
                    "aspect_ratio": "16:9",
                })),
        ])
    }

    /// Replaces or appends entries, matching on kind and model identifier.
    pub fn with_overrides(mut self, overrides: Vec<ModelInputSpec>) -> Self {
        for spec in overrides {
            match self
                .specs
                .iter_mut()
                .find(|existing| existing.kind == spec.kind && existing.model == spec.model)
            {
                Some(existing) => *existing = spec,
                None => self.specs.push(spec),
            }
        }
        self
    }

    pub fn get(&self, kind: GenerationKind, model: &str) -> Option<&ModelInputSpec> {
        self.specs
            .iter()
            .find(|spec| spec.kind == kind && spec.model == model)
    }

    /// Model identifiers available for `kind`, in catalog order
    pub fn models(&self, kind: GenerationKind) -> Vec<&str> {
        self.specs
            .iter()
            .filter(|spec| spec.kind == kind)
            .map(|spec| spec.model.as_str())
            .collect()
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
