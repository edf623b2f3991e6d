use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use archviz_contracts::analysis::{
    default_style_label, resolve_style_label, AnalysisResult, ImagePayload, PromptSuggestion,
    SynthesisError,
};
use archviz_contracts::events::{EventPayload, EventWriter};
use archviz_contracts::models::{
    DiscoveredModel, ModelCache, ModelSelector, RENDER_CAPABILITY, VISION_CAPABILITY,
};
use archviz_contracts::render::{
    RenderOutput, RenderRequest, DEFAULT_GUIDANCE_SCALE, DEFAULT_NEGATIVE_PROMPT,
    DEFAULT_RESOLUTION,
};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::discovery::ModelDiscovery;
use crate::render::{
    fetch_output, DryrunRenderer, RenderError, RendererRegistry, ReplicateRenderer,
};
use crate::synthesizer::PromptSynthesizer;
use crate::transport::{truncate_text, HttpTransport, Pause, ReqwestTransport, ThreadPause};

const MIN_RESOLUTION: u32 = 256;
const MAX_RESOLUTION: u32 = 1536;

pub fn new_session_id() -> String {
    format!("studio-{}", Uuid::new_v4())
}

/// State of one sketch-to-render interaction: inputs, the editable prompt and
/// the last render.
pub struct StudioSession {
    config: EngineConfig,
    events: EventWriter,
    transport: Arc<dyn HttpTransport>,
    synthesizer: PromptSynthesizer,
    renderers: RendererRegistry,
    model_selector: ModelSelector,
    cache: ModelCache,
    geometry: Option<ImagePayload>,
    geometry_path: Option<PathBuf>,
    reference: Option<ImagePayload>,
    reference_path: Option<PathBuf>,
    style_label: String,
    user_notes: Option<String>,
    clean_background: bool,
    requested_models: Vec<String>,
    render_model: Option<String>,
    prompt: Option<String>,
    negative_prompt: String,
    resolution: u32,
    guidance_scale: f64,
    steps: Option<u32>,
    last_suggestion: Option<PromptSuggestion>,
    last_render: Option<RenderOutput>,
    last_fallback_reason: Option<String>,
}

impl StudioSession {
    pub fn new(config: EngineConfig, events: EventWriter) -> Self {
        Self::with_transport(
            config,
            events,
            Arc::new(ReqwestTransport::new()),
            Arc::new(ThreadPause),
        )
    }

    pub fn with_transport(
        config: EngineConfig,
        events: EventWriter,
        transport: Arc<dyn HttpTransport>,
        pause: Arc<dyn Pause>,
    ) -> Self {
        let synthesizer = PromptSynthesizer::new(
            &config.gemini_api_base,
            config.request_timeout,
            Arc::clone(&transport),
            Arc::clone(&pause),
        )
        .with_discovery(config.discover_models);
        let mut renderers = RendererRegistry::new();
        renderers.register(DryrunRenderer);
        renderers.register(ReplicateRenderer::new(
            &config.replicate_api_base,
            config.request_timeout,
            Arc::clone(&transport),
            pause,
        ));

        Self {
            config,
            events,
            transport,
            synthesizer,
            renderers,
            model_selector: ModelSelector::new(None),
            cache: ModelCache::new(),
            geometry: None,
            geometry_path: None,
            reference: None,
            reference_path: None,
            style_label: default_style_label(),
            user_notes: None,
            clean_background: true,
            requested_models: Vec::new(),
            render_model: None,
            prompt: None,
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            resolution: DEFAULT_RESOLUTION,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            steps: None,
            last_suggestion: None,
            last_render: None,
            last_fallback_reason: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn set_geometry(&mut self, image: ImagePayload) {
        self.geometry = Some(image);
        self.geometry_path = None;
    }

    pub fn set_geometry_path(&mut self, path: &Path) -> Result<()> {
        let image = ImagePayload::from_path(path).context("failed loading geometry image")?;
        self.geometry = Some(image);
        self.geometry_path = Some(path.to_path_buf());
        Ok(())
    }

    pub fn geometry(&self) -> Option<&ImagePayload> {
        self.geometry.as_ref()
    }

    pub fn set_reference(&mut self, image: ImagePayload) {
        self.reference = Some(image);
        self.reference_path = None;
    }

    pub fn set_reference_path(&mut self, path: &Path) -> Result<()> {
        let image = ImagePayload::from_path(path).context("failed loading reference image")?;
        self.reference = Some(image);
        self.reference_path = Some(path.to_path_buf());
        Ok(())
    }

    pub fn clear_reference(&mut self) {
        self.reference = None;
        self.reference_path = None;
    }

    pub fn reference(&self) -> Option<&ImagePayload> {
        self.reference.as_ref()
    }

    /// Accepts a preset key (`glass`, `brick`, ...) or free text.
    pub fn set_style(&mut self, raw: &str) -> Result<&str, SynthesisError> {
        let label = resolve_style_label(raw)
            .ok_or_else(|| SynthesisError::InvalidInput("style label is empty".to_string()))?;
        self.style_label = label;
        Ok(&self.style_label)
    }

    pub fn style_label(&self) -> &str {
        &self.style_label
    }

    pub fn set_notes(&mut self, notes: Option<&str>) {
        self.user_notes = notes
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
    }

    pub fn notes(&self) -> Option<&str> {
        self.user_notes.as_deref()
    }

    pub fn set_clean_background(&mut self, clean: bool) {
        self.clean_background = clean;
    }

    pub fn clean_background(&self) -> bool {
        self.clean_background
    }

    pub fn set_models(&mut self, models: Vec<String>) {
        self.requested_models = models;
    }

    pub fn requested_models(&self) -> &[String] {
        &self.requested_models
    }

    pub fn set_render_model(&mut self, model: Option<String>) {
        self.render_model = model
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
    }

    /// User edit of the prompt; replaces whatever analysis produced.
    pub fn set_prompt(&mut self, prompt: &str) {
        let trimmed = prompt.trim();
        self.prompt = (!trimmed.is_empty()).then(|| trimmed.to_string());
    }

    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    pub fn set_negative_prompt(&mut self, negative: &str) {
        let trimmed = negative.trim();
        self.negative_prompt = if trimmed.is_empty() {
            DEFAULT_NEGATIVE_PROMPT.to_string()
        } else {
            trimmed.to_string()
        };
    }

    pub fn negative_prompt(&self) -> &str {
        &self.negative_prompt
    }

    pub fn set_resolution(&mut self, resolution: u32) {
        self.resolution = resolution.clamp(MIN_RESOLUTION, MAX_RESOLUTION);
    }

    pub fn set_guidance_scale(&mut self, scale: f64) {
        if scale.is_finite() {
            self.guidance_scale = scale.clamp(0.1, 30.0);
        }
    }

    pub fn set_steps(&mut self, steps: Option<u32>) {
        self.steps = steps.filter(|value| *value > 0).map(|value| value.min(100));
    }

    /// Applies `settings_update` entries from a parsed studio command.
    pub fn apply_settings(&mut self, settings: &BTreeMap<String, Value>) -> Result<()> {
        for (key, value) in settings {
            match key.as_str() {
                "resolution" => self.set_resolution(as_u32(key, value)?),
                "steps" => self.set_steps(Some(as_u32(key, value)?)),
                "guidance_scale" => self.set_guidance_scale(
                    value
                        .as_f64()
                        .ok_or_else(|| anyhow!("{key} must be a number"))?,
                ),
                "clean_background" => self.set_clean_background(
                    value
                        .as_bool()
                        .ok_or_else(|| anyhow!("{key} must be on or off"))?,
                ),
                other => return Err(anyhow!("unknown setting '{other}'")),
            }
        }
        Ok(())
    }

    pub fn last_suggestion(&self) -> Option<&PromptSuggestion> {
        self.last_suggestion.as_ref()
    }

    pub fn last_render(&self) -> Option<&RenderOutput> {
        self.last_render.as_ref()
    }

    pub fn last_fallback_reason(&self) -> Option<&str> {
        self.last_fallback_reason.as_deref()
    }

    /// Runs the vision analysis and keeps the prompt for editing.
    pub fn analyze(&mut self) -> AnalysisResult {
        let images = match self.geometry.as_ref() {
            Some(geometry) => std::iter::once(geometry)
                .chain(self.reference.iter())
                .cloned()
                .collect::<Vec<_>>(),
            None => Vec::new(),
        };
        let outcome = self.run_analysis(images);
        match &outcome {
            Ok(suggestion) => {
                self.prompt = Some(suggestion.prompt.clone());
                self.last_suggestion = Some(suggestion.clone());
                self.emit(
                    "analysis_succeeded",
                    json!({
                        "model": suggestion.model,
                        "attempts": suggestion.attempts,
                        "prompt": suggestion.prompt,
                    }),
                );
            }
            Err(err) => {
                self.emit(
                    "analysis_failed",
                    json!({
                        "error": err.to_string(),
                        "rate_limited": err.is_rate_limited(),
                        "attempted_models": err.attempted_models(),
                    }),
                );
            }
        }
        outcome
    }

    fn run_analysis(&mut self, images: Vec<ImagePayload>) -> AnalysisResult {
        if images.is_empty() {
            return Err(SynthesisError::NoInputImage);
        }
        let api_key = self.config.vision_api_key()?.to_string();
        let selection = self
            .model_selector
            .select_candidates(&self.requested_models, VISION_CAPABILITY)
            .map_err(|_| SynthesisError::NoCandidateModels)?;
        if let Some(reason) = selection.fallback_reason.as_deref() {
            info!(reason, "candidate selection");
        }
        self.last_fallback_reason = selection.fallback_reason.clone();
        self.emit(
            "analysis_started",
            json!({
                "style": self.style_label,
                "clean_background": self.clean_background,
                "has_reference": self.reference.is_some(),
                "candidates": selection.candidates.as_slice(),
            }),
        );
        self.synthesizer.synthesize_images(
            images,
            &self.style_label,
            self.user_notes.as_deref(),
            self.clean_background,
            &selection.candidates,
            &api_key,
            &self.cache,
        )
    }

    /// Looks up a vision model from the live list and caches it for analysis.
    pub fn discover(&mut self) -> Result<String> {
        let api_key = self.config.vision_api_key()?;
        let discovery = ModelDiscovery::new(
            &self.config.gemini_api_base,
            self.config.request_timeout,
            Arc::clone(&self.transport),
        );
        match discovery.discover(api_key) {
            Ok(model) => {
                self.cache
                    .set_discovered(DiscoveredModel::Found(model.clone()));
                self.emit("model_discovered", json!({ "model": model }));
                Ok(model)
            }
            Err(err) => {
                self.cache.set_discovered(DiscoveredModel::NotFound);
                Err(err.into())
            }
        }
    }

    pub fn render(&mut self) -> Result<RenderOutput> {
        let image = self.geometry.clone().ok_or(RenderError::NoInputImage)?;
        let prompt = self.prompt.clone().ok_or(RenderError::EmptyPrompt)?;
        let selection = self
            .model_selector
            .select(self.render_model.as_deref(), RENDER_CAPABILITY)
            .map_err(|message| anyhow!(message))?;
        if self.render_model.is_some() {
            if let Some(reason) = selection.fallback_reason.as_deref() {
                warn!(reason, "render model fallback");
            }
        }
        let model = selection.model;
        let renderer = self
            .renderers
            .get(&model.provider)
            .ok_or_else(|| RenderError::UnknownRenderer(model.provider.clone()))?;

        let mut request = RenderRequest::new(image, prompt);
        request.negative_prompt = self.negative_prompt.clone();
        request.resolution = self.resolution;
        request.guidance_scale = self.guidance_scale;
        request.steps = self.steps;

        self.emit(
            "render_started",
            json!({
                "model": model.reference(),
                "provider": model.provider,
                "resolution": request.resolution,
                "guidance_scale": request.guidance_scale,
                "steps": request.steps,
            }),
        );
        match renderer.render(&request, &model, self.config.render_api_token.as_deref()) {
            Ok(output) => {
                self.emit(
                    "render_succeeded",
                    json!({
                        "model": model.reference(),
                        "image_url": output.canonical().map(short_url),
                        "outputs": output.urls().len(),
                    }),
                );
                self.last_render = Some(output.clone());
                Ok(output)
            }
            Err(err) => {
                self.emit(
                    "render_failed",
                    json!({ "model": model.reference(), "error": format!("{err:#}") }),
                );
                Err(err.context("render failed"))
            }
        }
    }

    /// Writes the canonical image of the last render to `path`.
    pub fn save_render(&self, path: &Path) -> Result<PathBuf> {
        let url = self
            .last_render
            .as_ref()
            .and_then(RenderOutput::canonical)
            .ok_or_else(|| anyhow!("nothing rendered yet"))?;
        let bytes = fetch_output(self.transport.as_ref(), url, self.config.request_timeout)?;
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        fs::write(path, &bytes).with_context(|| format!("failed writing {}", path.display()))?;
        self.emit(
            "render_saved",
            json!({ "path": path.to_string_lossy(), "bytes": bytes.len() }),
        );
        Ok(path.to_path_buf())
    }

    pub fn summary(&self) -> Value {
        let discovered = match self.cache.discovered() {
            DiscoveredModel::Found(model) => Value::String(model),
            DiscoveredModel::NotFound => Value::String("none".to_string()),
            DiscoveredModel::Unknown => Value::Null,
        };
        json!({
            "session_id": self.events.session_id(),
            "geometry": describe_image(self.geometry.as_ref(), self.geometry_path.as_deref()),
            "reference": describe_image(self.reference.as_ref(), self.reference_path.as_deref()),
            "style": self.style_label,
            "notes": self.user_notes,
            "clean_background": self.clean_background,
            "models": self.requested_models,
            "render_model": self.render_model,
            "last_good_model": self.cache.last_good(),
            "discovered_model": discovered,
            "prompt": self.prompt,
            "negative_prompt": self.negative_prompt,
            "resolution": self.resolution,
            "guidance_scale": self.guidance_scale,
            "steps": self.steps,
            "last_render": self
                .last_render
                .as_ref()
                .and_then(RenderOutput::canonical)
                .map(short_url),
        })
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let payload = match payload {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        if let Err(err) = self.events.emit(event_type, payload) {
            warn!(event_type, error = %err, "failed writing session event");
        }
    }
}

fn as_u32(key: &str, value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|number| u32::try_from(number).ok())
        .ok_or_else(|| anyhow!("{key} must be a whole number"))
}

fn describe_image(image: Option<&ImagePayload>, path: Option<&Path>) -> Value {
    match (image, path) {
        (None, _) => Value::Null,
        (Some(image), Some(path)) => json!({
            "path": path.to_string_lossy(),
            "mime_type": image.mime_type,
            "bytes": image.bytes.len(),
        }),
        (Some(image), None) => json!({
            "mime_type": image.mime_type,
            "bytes": image.bytes.len(),
        }),
    }
}

/// Data URLs carry the whole image; keep summaries and events readable.
fn short_url(url: &str) -> String {
    if url.starts_with("data:") {
        truncate_text(url, 48)
    } else {
        url.to_string()
    }
}
