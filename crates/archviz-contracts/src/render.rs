use serde_json::Value;

use crate::analysis::ImagePayload;

pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "low quality, blurry, text, watermark, bad perspective, deformed";
pub const DEFAULT_RESOLUTION: u32 = 768;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 9.0;
pub const DEFAULT_LOW_THRESHOLD: u32 = 100;
pub const DEFAULT_HIGH_THRESHOLD: u32 = 200;

/// Inputs for the image-to-image render of the geometry image.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub image: ImagePayload,
    pub prompt: String,
    pub negative_prompt: String,
    pub resolution: u32,
    pub guidance_scale: f64,
    pub steps: Option<u32>,
    pub low_threshold: u32,
    pub high_threshold: u32,
}

impl RenderRequest {
    pub fn new(image: ImagePayload, prompt: impl Into<String>) -> Self {
        Self {
            image,
            prompt: prompt.into(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            resolution: DEFAULT_RESOLUTION,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            steps: None,
            low_threshold: DEFAULT_LOW_THRESHOLD,
            high_threshold: DEFAULT_HIGH_THRESHOLD,
        }
    }
}

/// What a renderer handed back, in the shape the upstream used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutput {
    Single(String),
    Many(Vec<String>),
}

impl RenderOutput {
    /// Accepts a bare string or an array of strings; anything else is `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(url) => {
                let trimmed = url.trim();
                (!trimmed.is_empty()).then(|| Self::Single(trimmed.to_string()))
            }
            Value::Array(rows) => {
                let urls = rows
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>();
                (!urls.is_empty()).then_some(Self::Many(urls))
            }
            _ => None,
        }
    }

    /// The rendered image. Canny ControlNet returns `[edge_map, render]`, so a
    /// list of two or more yields index 1.
    pub fn canonical(&self) -> Option<&str> {
        match self {
            Self::Single(url) => Some(url.as_str()),
            Self::Many(urls) => urls.get(1).or_else(|| urls.first()).map(String::as_str),
        }
    }

    pub fn urls(&self) -> Vec<&str> {
        match self {
            Self::Single(url) => vec![url.as_str()],
            Self::Many(urls) => urls.iter().map(String::as_str).collect(),
        }
    }
}
