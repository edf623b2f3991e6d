use std::env;
use std::fmt;
use std::time::Duration;

use archviz_contracts::analysis::SynthesisError;

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_REPLICATE_API_BASE: &str = "https://api.replicate.com/v1";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RENDER_MODEL: &str = "jagilley/controlnet-canny";

pub const VISION_KEY_ENV: &str = "GEMINI_API_KEY";
pub const RENDER_TOKEN_ENV: &str = "REPLICATE_API_TOKEN";

/// Host configuration. Secrets are redacted from `Debug`.
#[derive(Clone)]
pub struct EngineConfig {
    pub gemini_api_base: String,
    pub replicate_api_base: String,
    pub vision_api_key: Option<String>,
    pub render_api_token: Option<String>,
    pub request_timeout: Duration,
    pub discover_models: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gemini_api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            replicate_api_base: DEFAULT_REPLICATE_API_BASE.to_string(),
            vision_api_key: None,
            render_api_token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            discover_models: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let api_base = |key: &str, default: &str| {
            non_empty(key)
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| default.to_string())
        };

        let request_timeout = non_empty("ARCHVIZ_REQUEST_TIMEOUT")
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .map(clamp_timeout_seconds)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let discover_models = non_empty("ARCHVIZ_DISCOVER_MODELS")
            .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        Self {
            gemini_api_base: api_base("GEMINI_API_BASE", DEFAULT_GEMINI_API_BASE),
            replicate_api_base: api_base("REPLICATE_API_BASE", DEFAULT_REPLICATE_API_BASE),
            vision_api_key: non_empty(VISION_KEY_ENV).or_else(|| non_empty("GOOGLE_API_KEY")),
            render_api_token: non_empty(RENDER_TOKEN_ENV)
                .or_else(|| non_empty("REPLICATE_API_KEY")),
            request_timeout,
            discover_models,
        }
    }

    pub fn with_timeout_seconds(mut self, seconds: f64) -> Self {
        if seconds.is_finite() {
            self.request_timeout = clamp_timeout_seconds(seconds);
        }
        self
    }

    pub fn vision_api_key(&self) -> Result<&str, SynthesisError> {
        self.vision_api_key
            .as_deref()
            .ok_or_else(|| SynthesisError::MissingCredential(VISION_KEY_ENV.to_string()))
    }
}

fn clamp_timeout_seconds(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.clamp(1.0, 600.0))
}

fn redact(value: &Option<String>) -> &'static str {
    if value.is_some() {
        "<redacted>"
    } else {
        "<unset>"
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("gemini_api_base", &self.gemini_api_base)
            .field("replicate_api_base", &self.replicate_api_base)
            .field("vision_api_key", &redact(&self.vision_api_key))
            .field("render_api_token", &redact(&self.render_api_token))
            .field("request_timeout", &self.request_timeout)
            .field("discover_models", &self.discover_models)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let config = config_from(&[]);
        assert_eq!(config.gemini_api_base, DEFAULT_GEMINI_API_BASE);
        assert_eq!(config.replicate_api_base, DEFAULT_REPLICATE_API_BASE);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(!config.discover_models);
        assert_eq!(
            config.vision_api_key().unwrap_err(),
            SynthesisError::MissingCredential("GEMINI_API_KEY".to_string())
        );
        assert_eq!(config.render_api_token, None);
    }

    #[test]
    fn reads_keys_with_fallbacks_and_trims() {
        let config = config_from(&[
            ("GEMINI_API_KEY", "  "),
            ("GOOGLE_API_KEY", " g-key "),
            ("REPLICATE_API_KEY", "r-token"),
            ("GEMINI_API_BASE", "http://localhost:9000/v1beta/"),
            ("ARCHVIZ_DISCOVER_MODELS", "Yes"),
        ]);
        assert_eq!(config.vision_api_key().unwrap(), "g-key");
        assert_eq!(config.render_api_token.as_deref(), Some("r-token"));
        assert_eq!(config.gemini_api_base, "http://localhost:9000/v1beta");
        assert!(config.discover_models);
    }

    #[test]
    fn timeout_is_clamped() {
        assert_eq!(
            config_from(&[("ARCHVIZ_REQUEST_TIMEOUT", "0.01")]).request_timeout,
            Duration::from_secs(1)
        );
        assert_eq!(
            config_from(&[("ARCHVIZ_REQUEST_TIMEOUT", "9999")]).request_timeout,
            Duration::from_secs(600)
        );
        assert_eq!(
            config_from(&[("ARCHVIZ_REQUEST_TIMEOUT", "soon")]).request_timeout,
            DEFAULT_REQUEST_TIMEOUT
        );
        assert_eq!(
            EngineConfig::default()
                .with_timeout_seconds(45.0)
                .request_timeout,
            Duration::from_secs(45)
        );
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = config_from(&[
            ("GEMINI_API_KEY", "super-secret"),
            ("REPLICATE_API_TOKEN", "also-secret"),
        ]);
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("also-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
