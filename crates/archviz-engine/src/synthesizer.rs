//! Vision analysis: turns a geometry drawing (plus optional style reference)
//! into an editable render prompt.
//!
//! Each candidate model gets up to [`MAX_ATTEMPTS_PER_MODEL`] attempts. Only
//! HTTP 429 is retried, after a linear [`backoff_delay`]. Every other failure
//! moves straight on to the next candidate.

use std::sync::Arc;
use std::time::Duration;

use archviz_contracts::analysis::{
    AnalysisRequest, AnalysisResult, CandidateError, CandidateFailure, ImagePayload,
    PromptSuggestion, SynthesisError,
};
use archviz_contracts::models::{DiscoveredModel, ModelCache, ModelCandidates};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::discovery::ModelDiscovery;
use crate::transport::{error_chain_text, truncate_text, Auth, HttpTransport, Pause};

pub const MAX_ATTEMPTS_PER_MODEL: u32 = 3;
pub const BACKOFF_STEP: Duration = Duration::from_secs(2);

/// Wait after the `attempt`-th rate-limited try (1-based): 2s, then 4s.
pub fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_STEP * attempt
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisState {
    Idle,
    Sending { model: String, attempt: u32 },
    RetryWait { model: String, attempt: u32, delay: Duration },
    NextCandidate,
    Success(PromptSuggestion),
    Failed,
}

impl SynthesisState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Failed)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<ResponseCandidate>>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct ResponseCandidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    parts: Option<Vec<ResponsePart>>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

pub struct PromptSynthesizer {
    api_base: String,
    timeout: Duration,
    transport: Arc<dyn HttpTransport>,
    pause: Arc<dyn Pause>,
    discovery: Option<ModelDiscovery>,
}

impl PromptSynthesizer {
    pub fn new(
        api_base: &str,
        timeout: Duration,
        transport: Arc<dyn HttpTransport>,
        pause: Arc<dyn Pause>,
    ) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            timeout,
            transport,
            pause,
            discovery: None,
        }
    }

    /// Lets the synthesizer look up a model once per cache before its first
    /// request.
    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.discovery = enabled.then(|| {
            ModelDiscovery::new(&self.api_base, self.timeout, Arc::clone(&self.transport))
        });
        self
    }

    pub fn discovery(&self) -> Option<&ModelDiscovery> {
        self.discovery.as_ref()
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    /// Builds the request from raw inputs and runs it. An empty image list is
    /// rejected before any network call.
    #[allow(clippy::too_many_arguments)]
    pub fn synthesize_images(
        &self,
        images: Vec<ImagePayload>,
        style_label: &str,
        user_notes: Option<&str>,
        clean_background: bool,
        candidates: &ModelCandidates,
        api_key: &str,
        cache: &ModelCache,
    ) -> AnalysisResult {
        let request = AnalysisRequest::new(images, style_label, user_notes, clean_background)?;
        self.synthesize(&request, candidates, api_key, cache)
    }

    pub fn synthesize(
        &self,
        request: &AnalysisRequest,
        candidates: &ModelCandidates,
        api_key: &str,
        cache: &ModelCache,
    ) -> AnalysisResult {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(SynthesisError::MissingCredential(
                crate::config::VISION_KEY_ENV.to_string(),
            ));
        }

        self.discover_once(api_key, cache);
        let ordered = candidates.with_preferred(cache.preferred_models());
        let payload = json!({
            "contents": [{ "parts": request.parts() }],
        });

        let mut queue = ordered.iter();
        let mut failures: Vec<CandidateFailure> = Vec::new();
        let mut state = SynthesisState::Idle;
        loop {
            state = match state {
                SynthesisState::Idle | SynthesisState::NextCandidate => match queue.next() {
                    Some(model) => SynthesisState::Sending {
                        model: model.to_string(),
                        attempt: 1,
                    },
                    None => SynthesisState::Failed,
                },
                SynthesisState::Sending { model, attempt } => {
                    debug!(%model, attempt, "sending vision analysis request");
                    match self.send_once(&model, api_key, &payload) {
                        Ok(prompt) => SynthesisState::Success(PromptSuggestion {
                            model,
                            prompt,
                            attempts: attempt,
                        }),
                        Err(CandidateError::RateLimited) if attempt < MAX_ATTEMPTS_PER_MODEL => {
                            SynthesisState::RetryWait {
                                delay: backoff_delay(attempt),
                                model,
                                attempt,
                            }
                        }
                        Err(error) => {
                            warn!(%model, attempt, %error, "candidate model failed");
                            failures.push(CandidateFailure {
                                model,
                                attempts: attempt,
                                error,
                            });
                            SynthesisState::NextCandidate
                        }
                    }
                }
                SynthesisState::RetryWait {
                    model,
                    attempt,
                    delay,
                } => {
                    info!(%model, attempt, delay_s = delay.as_secs_f64(), "rate limited; backing off");
                    self.pause.pause(delay);
                    SynthesisState::Sending {
                        model,
                        attempt: attempt + 1,
                    }
                }
                SynthesisState::Success(suggestion) => {
                    info!(model = %suggestion.model, attempts = suggestion.attempts, "vision analysis succeeded");
                    cache.remember_success(&suggestion.model);
                    return Ok(suggestion);
                }
                SynthesisState::Failed => {
                    warn!(candidates = failures.len(), "all candidate models failed");
                    return Err(SynthesisError::AllCandidatesFailed(failures));
                }
            };
        }
    }

    fn discover_once(&self, api_key: &str, cache: &ModelCache) {
        let Some(discovery) = self.discovery.as_ref() else {
            return;
        };
        if cache.discovered() != DiscoveredModel::Unknown {
            return;
        }
        let discovered = match discovery.discover(api_key) {
            Ok(model) => DiscoveredModel::Found(model),
            Err(err) => {
                warn!(error = %err, "model discovery failed; using configured candidates");
                DiscoveredModel::NotFound
            }
        };
        cache.set_discovered(discovered);
    }

    fn send_once(&self, model: &str, api_key: &str, payload: &Value) -> Result<String, CandidateError> {
        let endpoint = self.endpoint_for_model(model);
        let reply = self
            .transport
            .post_json(&endpoint, Auth::ApiKeyQuery(api_key), payload, self.timeout)
            .map_err(|err| CandidateError::Transport(error_chain_text(&err, 512)))?;
        match reply.status {
            200 => extract_prompt_text(&reply.body).map_err(CandidateError::Parse),
            429 => Err(CandidateError::RateLimited),
            status => Err(CandidateError::UpstreamHttp {
                status,
                body: truncate_text(&reply.text(), 512),
            }),
        }
    }
}

/// Reads `candidates[0].content.parts[0].text`.
fn extract_prompt_text(body: &[u8]) -> Result<String, String> {
    let parsed: GenerateContentResponse =
        serde_json::from_slice(body).map_err(|err| format!("invalid JSON payload: {err}"))?;
    let first_candidate = parsed
        .candidates
        .and_then(|candidates| candidates.into_iter().next());
    let Some(candidate) = first_candidate else {
        let reason = parsed
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
            .map(|reason| format!(" (blocked: {reason})"))
            .unwrap_or_default();
        return Err(format!("response has no candidates{reason}"));
    };
    let text = candidate
        .content
        .and_then(|content| content.parts)
        .and_then(|parts| parts.into_iter().next())
        .and_then(|part| part.text)
        .ok_or_else(|| "response missing candidates[0].content.parts[0].text".to_string())?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("response text is empty".to_string());
    }
    Ok(trimmed.to_string())
}
