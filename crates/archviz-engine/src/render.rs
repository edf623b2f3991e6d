use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use archviz_contracts::models::ModelSpec;
use archviz_contracts::render::{RenderOutput, RenderRequest};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::RENDER_TOKEN_ENV;
use crate::transport::{truncate_text, Auth, HttpReply, HttpTransport, Pause};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("missing credential: {0} is not set")]
    MissingCredential(&'static str),
    #[error("no input image: provide a geometry image first")]
    NoInputImage,
    #[error("render prompt is empty: run analysis or type a prompt first")]
    EmptyPrompt,
    #[error("no renderer registered for provider '{0}'")]
    UnknownRenderer(String),
}

pub trait ImageRenderer: Send + Sync {
    fn name(&self) -> &str;
    fn render(
        &self,
        request: &RenderRequest,
        model: &ModelSpec,
        token: Option<&str>,
    ) -> Result<RenderOutput>;
}

#[derive(Default)]
pub struct RendererRegistry {
    renderers: BTreeMap<String, Box<dyn ImageRenderer>>,
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<R: ImageRenderer + 'static>(&mut self, renderer: R) {
        self.renderers
            .insert(renderer.name().to_string(), Box::new(renderer));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageRenderer> {
        self.renderers.get(name).map(|renderer| renderer.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.renderers.keys().cloned().collect()
    }
}

fn validate_request(request: &RenderRequest) -> Result<(), RenderError> {
    if request.image.bytes.is_empty() {
        return Err(RenderError::NoInputImage);
    }
    if request.prompt.trim().is_empty() {
        return Err(RenderError::EmptyPrompt);
    }
    Ok(())
}

/// Offline renderer: hands the geometry image back unchanged.
pub struct DryrunRenderer;

impl ImageRenderer for DryrunRenderer {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn render(
        &self,
        request: &RenderRequest,
        model: &ModelSpec,
        _token: Option<&str>,
    ) -> Result<RenderOutput> {
        validate_request(request)?;
        debug!(model = %model.name, "dryrun render");
        Ok(RenderOutput::Single(request.image.to_data_url()))
    }
}

/// ControlNet renders through Replicate predictions.
pub struct ReplicateRenderer {
    api_base: String,
    timeout: Duration,
    poll_interval: Duration,
    poll_timeout: Duration,
    transport: Arc<dyn HttpTransport>,
    pause: Arc<dyn Pause>,
}

impl ReplicateRenderer {
    pub fn new(
        api_base: &str,
        timeout: Duration,
        transport: Arc<dyn HttpTransport>,
        pause: Arc<dyn Pause>,
    ) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            transport,
            pause,
        }
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(200));
        self.poll_timeout = timeout.max(self.poll_interval);
        self
    }

    fn max_polls(&self) -> u32 {
        let polls = self.poll_timeout.as_secs_f64() / self.poll_interval.as_secs_f64();
        polls.ceil().max(1.0) as u32
    }

    /// Pinned versions go through `/predictions`; bare model names through the
    /// model's own predictions route.
    fn prediction_target(&self, model: &ModelSpec, input: Map<String, Value>) -> (String, Value) {
        match model.version.as_deref() {
            Some(version) => (
                format!("{}/predictions", self.api_base),
                json!({ "version": version, "input": input }),
            ),
            None => (
                format!("{}/models/{}/predictions", self.api_base, model.name.trim()),
                json!({ "input": input }),
            ),
        }
    }

    fn build_input(request: &RenderRequest) -> Map<String, Value> {
        let mut input = Map::new();
        input.insert("image".to_string(), json!(request.image.to_data_url()));
        input.insert("prompt".to_string(), json!(request.prompt.trim()));
        input.insert("negative_prompt".to_string(), json!(request.negative_prompt));
        input.insert("image_resolution".to_string(), json!(request.resolution));
        input.insert("scale".to_string(), json!(request.guidance_scale));
        input.insert("low_threshold".to_string(), json!(request.low_threshold));
        input.insert("high_threshold".to_string(), json!(request.high_threshold));
        input.insert("return_image".to_string(), Value::Bool(true));
        if let Some(steps) = request.steps {
            input.insert("ddim_steps".to_string(), json!(steps));
        }
        input
    }

    fn poll_prediction(&self, poll_url: &str, token: &str) -> Result<Value> {
        for poll in 1..=self.max_polls() {
            self.pause.pause(self.poll_interval);
            let reply = self
                .transport
                .get(poll_url, Auth::Bearer(token), self.timeout)
                .context("Replicate poll request failed")?;
            let prediction = response_json_or_error("Replicate poll", reply)?;
            match prediction_status(&prediction).as_str() {
                "succeeded" => return Ok(prediction),
                "failed" | "canceled" => bail!(
                    "Replicate prediction failed: {}",
                    prediction_error(&prediction)
                ),
                status => debug!(poll, status, "prediction still running"),
            }
        }
        bail!(
            "Replicate polling timed out after {:.1}s",
            self.poll_timeout.as_secs_f64()
        )
    }
}

impl ImageRenderer for ReplicateRenderer {
    fn name(&self) -> &str {
        "replicate"
    }

    fn render(
        &self,
        request: &RenderRequest,
        model: &ModelSpec,
        token: Option<&str>,
    ) -> Result<RenderOutput> {
        let token = token
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(RenderError::MissingCredential(RENDER_TOKEN_ENV))?;
        validate_request(request)?;

        let (endpoint, payload) = self.prediction_target(model, Self::build_input(request));
        info!(model = %model.reference(), resolution = request.resolution, "starting render");
        let reply = self
            .transport
            .post_json(&endpoint, Auth::Bearer(token), &payload, self.timeout)
            .context("Replicate request failed")?;
        let mut prediction = response_json_or_error("Replicate", reply)?;

        match prediction_status(&prediction).as_str() {
            "succeeded" => {}
            "failed" | "canceled" => bail!(
                "Replicate prediction failed: {}",
                prediction_error(&prediction)
            ),
            _ => {
                let poll_url = prediction
                    .get("urls")
                    .and_then(Value::as_object)
                    .and_then(|urls| urls.get("get"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("Replicate prediction missing poll URL"))?;
                prediction = self.poll_prediction(&poll_url, token)?;
            }
        }

        let output = prediction
            .get("output")
            .and_then(RenderOutput::from_value)
            .ok_or_else(|| anyhow!("Replicate response returned no image URLs"))?;
        info!(outputs = output.urls().len(), "render finished");
        Ok(output)
    }
}

fn prediction_status(prediction: &Value) -> String {
    prediction
        .get("status")
        .and_then(Value::as_str)
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default()
}

fn prediction_error(prediction: &Value) -> String {
    match prediction.get("error") {
        Some(Value::String(message)) if !message.trim().is_empty() => message.trim().to_string(),
        _ => truncate_text(&prediction.to_string(), 512),
    }
}

fn response_json_or_error(provider: &str, reply: HttpReply) -> Result<Value> {
    let body = reply.text();
    if !(200..300).contains(&reply.status) {
        bail!(
            "{provider} request failed ({}): {}",
            reply.status,
            truncate_text(&body, 512)
        );
    }
    serde_json::from_str(&body).with_context(|| format!("{provider} returned invalid JSON payload"))
}

/// Bytes of a render output: decoded in place for `data:` URLs, downloaded
/// otherwise.
pub fn fetch_output(transport: &dyn HttpTransport, url: &str, timeout: Duration) -> Result<Vec<u8>> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (_, encoded) = rest
            .split_once(";base64,")
            .ok_or_else(|| anyhow!("unsupported data URL (expected base64)"))?;
        return BASE64
            .decode(encoded.trim())
            .context("failed decoding data URL");
    }
    let reply = transport
        .get(url, Auth::None, timeout)
        .context("failed downloading render output")?;
    if !(200..300).contains(&reply.status) {
        bail!(
            "render download failed ({}): {}",
            reply.status,
            truncate_text(&reply.text(), 512)
        );
    }
    Ok(reply.body)
}

#[cfg(test)]
mod tests {
    use archviz_contracts::analysis::ImagePayload;
    use archviz_contracts::models::{ModelRegistry, RENDER_CAPABILITY};

    use super::*;
    use crate::transport::testing::{RecordingPause, ScriptedTransport};

    const BASE: &str = "https://render.test/v1";

    fn request() -> RenderRequest {
        let mut request = RenderRequest::new(
            ImagePayload::new(b"edges".to_vec(), "image/png"),
            " glass tower, dusk ",
        );
        request.steps = Some(20);
        request
    }

    fn canny() -> ModelSpec {
        ModelRegistry::new(None)
            .ensure("jagilley/controlnet-canny", RENDER_CAPABILITY)
            .unwrap()
    }

    fn renderer(
        transport: &Arc<ScriptedTransport>,
        pause: &Arc<RecordingPause>,
    ) -> ReplicateRenderer {
        ReplicateRenderer::new(BASE, Duration::from_secs(30), transport.clone(), pause.clone())
    }

    #[test]
    fn posts_versioned_prediction_with_controlnet_input() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::new().json(
            201,
            json!({ "status": "succeeded", "output": ["https://cdn/edges.png", "https://cdn/render.png"] }),
        ));
        let pause = Arc::new(RecordingPause::default());

        let output = renderer(&transport, &pause).render(&request(), &canny(), Some("r8_tok"))?;
        assert_eq!(output.canonical(), Some("https://cdn/render.png"));

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, format!("{BASE}/predictions"));
        assert_eq!(calls[0].auth, "bearer=r8_tok");
        let payload = calls[0].payload.clone().unwrap_or_default();
        assert_eq!(payload["version"], json!(canny().version.unwrap()));
        let input = &payload["input"];
        assert_eq!(input["image"], json!("data:image/png;base64,ZWRnZXM="));
        assert_eq!(input["prompt"], json!("glass tower, dusk"));
        assert_eq!(input["image_resolution"], json!(768));
        assert_eq!(input["scale"], json!(9.0));
        assert_eq!(input["low_threshold"], json!(100));
        assert_eq!(input["high_threshold"], json!(200));
        assert_eq!(input["return_image"], json!(true));
        assert_eq!(input["ddim_steps"], json!(20));
        assert!(pause.delays().is_empty());
        Ok(())
    }

    #[test]
    fn unversioned_model_uses_model_route() -> anyhow::Result<()> {
        let transport = Arc::new(
            ScriptedTransport::new().json(200, json!({ "status": "succeeded", "output": "https://cdn/one.png" })),
        );
        let pause = Arc::new(RecordingPause::default());
        let model = ModelSpec {
            name: "acme/sketch-render".to_string(),
            provider: "replicate".to_string(),
            capabilities: vec![RENDER_CAPABILITY.to_string()],
            version: None,
        };

        let output = renderer(&transport, &pause).render(&request(), &model, Some("t"))?;
        assert_eq!(output, RenderOutput::Single("https://cdn/one.png".to_string()));
        assert_eq!(
            transport.urls(),
            vec![format!("{BASE}/models/acme/sketch-render/predictions")]
        );
        let payload = transport.calls()[0].payload.clone().unwrap_or_default();
        assert!(payload.get("version").is_none());
        Ok(())
    }

    #[test]
    fn polls_until_prediction_succeeds() -> anyhow::Result<()> {
        let poll_url = "https://render.test/v1/predictions/abc";
        let transport = Arc::new(
            ScriptedTransport::new()
                .json(201, json!({ "status": "starting", "urls": { "get": poll_url } }))
                .json(200, json!({ "status": "processing" }))
                .json(200, json!({ "status": "succeeded", "output": ["https://cdn/a.png"] })),
        );
        let pause = Arc::new(RecordingPause::default());

        let output = renderer(&transport, &pause).render(&request(), &canny(), Some("t"))?;
        assert_eq!(output.canonical(), Some("https://cdn/a.png"));
        assert_eq!(pause.delays(), vec![Duration::from_secs(1); 2]);
        let calls = transport.calls();
        assert_eq!(calls[1].method, "GET");
        assert_eq!(calls[1].url, poll_url);
        assert_eq!(calls[2].auth, "bearer=t");
        Ok(())
    }

    #[test]
    fn polling_gives_up_after_timeout() {
        let mut script = ScriptedTransport::new().json(
            201,
            json!({ "status": "processing", "urls": { "get": "https://render.test/p/1" } }),
        );
        for _ in 0..3 {
            script = script.json(200, json!({ "status": "processing" }));
        }
        let transport = Arc::new(script);
        let pause = Arc::new(RecordingPause::default());

        let err = renderer(&transport, &pause)
            .with_polling(Duration::from_secs(1), Duration::from_secs(3))
            .render(&request(), &canny(), Some("t"))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(pause.delays().len(), 3);
        assert_eq!(transport.remaining(), 0);
    }

    #[test]
    fn failed_prediction_reports_upstream_error() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .json(201, json!({ "status": "failed", "error": "CUDA out of memory" })),
        );
        let pause = Arc::new(RecordingPause::default());
        let err = renderer(&transport, &pause)
            .render(&request(), &canny(), Some("t"))
            .unwrap_err();
        assert!(err.to_string().contains("CUDA out of memory"));
    }

    #[test]
    fn http_error_body_is_surfaced() {
        let transport = Arc::new(ScriptedTransport::new().reply(422, "invalid version"));
        let pause = Arc::new(RecordingPause::default());
        let err = renderer(&transport, &pause)
            .render(&request(), &canny(), Some("t"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Replicate request failed (422): invalid version");
    }

    #[test]
    fn missing_token_and_empty_prompt_fail_before_network() {
        let transport = Arc::new(ScriptedTransport::new());
        let pause = Arc::new(RecordingPause::default());
        let renderer = renderer(&transport, &pause);

        let err = renderer.render(&request(), &canny(), Some("  ")).unwrap_err();
        assert_eq!(
            err.downcast_ref::<RenderError>(),
            Some(&RenderError::MissingCredential("REPLICATE_API_TOKEN"))
        );

        let mut blank = request();
        blank.prompt = "   ".to_string();
        let err = renderer.render(&blank, &canny(), Some("t")).unwrap_err();
        assert_eq!(err.downcast_ref::<RenderError>(), Some(&RenderError::EmptyPrompt));
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn dryrun_returns_input_as_data_url() -> anyhow::Result<()> {
        let model = ModelRegistry::new(None)
            .ensure("dryrun-render", RENDER_CAPABILITY)
            .unwrap();
        let output = DryrunRenderer.render(&request(), &model, None)?;
        assert_eq!(
            output.canonical(),
            Some("data:image/png;base64,ZWRnZXM=")
        );
        Ok(())
    }

    #[test]
    fn registry_looks_up_by_provider_name() {
        let transport = Arc::new(ScriptedTransport::new());
        let pause = Arc::new(RecordingPause::default());
        let mut registry = RendererRegistry::new();
        registry.register(DryrunRenderer);
        registry.register(renderer(&transport, &pause));
        assert_eq!(registry.names(), vec!["dryrun", "replicate"]);
        assert!(registry.get("replicate").is_some());
        assert!(registry.get("stability").is_none());
    }

    #[test]
    fn fetch_output_decodes_data_urls_and_downloads_others() -> anyhow::Result<()> {
        let transport = ScriptedTransport::new()
            .reply(200, "png-bytes")
            .reply(404, "gone");
        let timeout = Duration::from_secs(5);

        assert_eq!(
            fetch_output(&transport, "data:image/png;base64,ZWRnZXM=", timeout)?,
            b"edges".to_vec()
        );
        assert_eq!(
            fetch_output(&transport, "https://cdn/render.png", timeout)?,
            b"png-bytes".to_vec()
        );
        let err = fetch_output(&transport, "https://cdn/missing.png", timeout).unwrap_err();
        assert!(err.to_string().contains("404"));
        assert_eq!(transport.calls()[0].auth, "none");
        Ok(())
    }
}
