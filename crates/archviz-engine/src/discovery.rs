//! Picks a vision-capable Gemini model from the live model list.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::transport::{error_chain_text, truncate_text, Auth, HttpTransport};

/// Substrings tried in order against eligible model names.
pub const DISCOVERY_PREFERENCES: &[&str] =
    &["gemini-1.5-flash", "gemini-1.5-pro", "gemini-pro-vision"];
pub const DISCOVERY_FALLBACK_KEYWORD: &str = "vision";
const GENERATE_CONTENT_METHOD: &str = "generateContent";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("no vision-capable model found in the model list")]
    NotFound,
    #[error("model list request returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("model list request failed: {0}")]
    Transport(String),
    #[error("model list response was not understood: {0}")]
    Parse(String),
}

#[derive(Debug, Deserialize)]
struct ListModelsResponse {
    #[serde(default)]
    models: Vec<ListedModel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListedModel {
    pub name: String,
    #[serde(default, rename = "supportedGenerationMethods")]
    pub supported_generation_methods: Vec<String>,
}

impl ListedModel {
    fn can_generate(&self) -> bool {
        self.supported_generation_methods
            .iter()
            .any(|method| method == GENERATE_CONTENT_METHOD)
    }

    fn short_name(&self) -> &str {
        self.name.trim().trim_start_matches("models/")
    }
}

pub struct ModelDiscovery {
    api_base: String,
    timeout: Duration,
    transport: Arc<dyn HttpTransport>,
}

impl ModelDiscovery {
    pub fn new(api_base: &str, timeout: Duration, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            timeout,
            transport,
        }
    }

    fn list_endpoint(&self) -> String {
        format!("{}/models?pageSize=1000", self.api_base)
    }

    pub fn discover(&self, api_key: &str) -> Result<String, DiscoveryError> {
        let endpoint = self.list_endpoint();
        let reply = self
            .transport
            .get(&endpoint, Auth::ApiKeyQuery(api_key), self.timeout)
            .map_err(|err| DiscoveryError::Transport(error_chain_text(&err, 512)))?;
        if reply.status != 200 {
            return Err(DiscoveryError::Upstream {
                status: reply.status,
                body: truncate_text(&reply.text(), 512),
            });
        }
        let listing: ListModelsResponse = serde_json::from_slice(&reply.body)
            .map_err(|err| DiscoveryError::Parse(err.to_string()))?;
        debug!(count = listing.models.len(), "listed models");

        let chosen = pick_preferred_model(&listing.models).ok_or(DiscoveryError::NotFound)?;
        info!(model = %chosen, "discovered vision model");
        Ok(chosen)
    }
}

/// First eligible model matching the preference list, else the first
/// eligible one mentioning `vision`.
pub fn pick_preferred_model(models: &[ListedModel]) -> Option<String> {
    let eligible = models
        .iter()
        .filter(|model| model.can_generate())
        .collect::<Vec<_>>();
    for keyword in DISCOVERY_PREFERENCES {
        if let Some(model) = eligible
            .iter()
            .find(|model| model.short_name().contains(keyword))
        {
            return Some(model.short_name().to_string());
        }
    }
    eligible
        .iter()
        .find(|model| model.short_name().contains(DISCOVERY_FALLBACK_KEYWORD))
        .map(|model| model.short_name().to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::transport::testing::ScriptedTransport;

    fn listed(name: &str, methods: &[&str]) -> ListedModel {
        ListedModel {
            name: name.to_string(),
            supported_generation_methods: methods.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn preference_order_beats_listing_order() {
        let models = vec![
            listed("models/gemini-pro-vision", &["generateContent"]),
            listed("models/gemini-1.5-pro-latest", &["generateContent"]),
            listed("models/gemini-1.5-flash-001", &["generateContent", "countTokens"]),
        ];
        assert_eq!(
            pick_preferred_model(&models).as_deref(),
            Some("gemini-1.5-flash-001")
        );
    }

    #[test]
    fn ineligible_models_are_skipped() {
        let models = vec![
            listed("models/gemini-1.5-flash", &["embedContent"]),
            listed("models/gemini-1.5-pro", &["generateContent"]),
        ];
        assert_eq!(pick_preferred_model(&models).as_deref(), Some("gemini-1.5-pro"));
    }

    #[test]
    fn falls_back_to_any_vision_model() {
        let models = vec![
            listed("models/text-bison", &["generateContent"]),
            listed("models/acme-vision-2", &["generateContent"]),
        ];
        assert_eq!(pick_preferred_model(&models).as_deref(), Some("acme-vision-2"));
        assert_eq!(
            pick_preferred_model(&[listed("models/text-bison", &["generateContent"])]),
            None
        );
    }

    #[test]
    fn discover_queries_model_list_with_key() {
        let transport = Arc::new(ScriptedTransport::new().json(
            200,
            json!({
                "models": [
                    { "name": "models/embedding-001", "supportedGenerationMethods": ["embedContent"] },
                    { "name": "models/gemini-1.5-pro", "supportedGenerationMethods": ["generateContent"] }
                ]
            }),
        ));
        let discovery =
            ModelDiscovery::new("https://api.test/v1beta/", Duration::from_secs(5), transport.clone());
        assert_eq!(discovery.discover("k").unwrap(), "gemini-1.5-pro");

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "GET");
        assert_eq!(calls[0].url, "https://api.test/v1beta/models?pageSize=1000");
        assert_eq!(calls[0].auth, "key=k");
    }

    #[test]
    fn discover_maps_failures() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .json(200, json!({ "models": [] }))
                .reply(403, "forbidden")
                .reply(200, "not json")
                .fail("connection refused"),
        );
        let discovery = ModelDiscovery::new("https://api.test", Duration::from_secs(5), transport);
        assert_eq!(discovery.discover("k").unwrap_err(), DiscoveryError::NotFound);
        assert_eq!(
            discovery.discover("k").unwrap_err(),
            DiscoveryError::Upstream {
                status: 403,
                body: "forbidden".to_string()
            }
        );
        assert!(matches!(discovery.discover("k"), Err(DiscoveryError::Parse(_))));
        assert!(matches!(
            discovery.discover("k"),
            Err(DiscoveryError::Transport(message)) if message.contains("connection refused")
        ));
    }
}
