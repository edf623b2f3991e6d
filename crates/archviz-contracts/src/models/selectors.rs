use super::registry::{ModelRegistry, ModelSpec};
use crate::analysis::SynthesisError;

/// Ordered, deduplicated, non-empty list of model identifiers, most
/// preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCandidates {
    models: Vec<String>,
}

impl ModelCandidates {
    pub fn new<I, S>(models: I) -> Result<Self, SynthesisError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut deduped: Vec<String> = Vec::new();
        for model in models {
            let trimmed = model.as_ref().trim().trim_start_matches("models/");
            if trimmed.is_empty() || deduped.iter().any(|existing| existing == trimmed) {
                continue;
            }
            deduped.push(trimmed.to_string());
        }
        if deduped.is_empty() {
            return Err(SynthesisError::NoCandidateModels);
        }
        Ok(Self { models: deduped })
    }

    /// Moves `preferred` models to the front, keeping the rest in order.
    pub fn with_preferred<I, S>(&self, preferred: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ordered: Vec<String> = preferred
            .into_iter()
            .map(|model| model.as_ref().to_string())
            .collect();
        ordered.extend(self.models.iter().cloned());
        Self::new(ordered).unwrap_or_else(|_| self.clone())
    }

    pub fn as_slice(&self) -> &[String] {
        self.models.as_slice()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSelection {
    pub candidates: ModelCandidates,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(model) = self.registry.ensure(requested_value, capability) {
                return Ok(ModelSelection {
                    model,
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            (
                Some(format!(
                    "Requested model '{requested_value}' unavailable for capability '{capability}'."
                )),
                Some(requested_value.to_string()),
            )
        } else {
            (Some("No model specified; using default.".to_string()), None)
        };

        let candidates = self.registry.by_capability(capability);
        let Some(model) = candidates.first().cloned() else {
            return Err(format!(
                "No models available for capability '{capability}'."
            ));
        };
        Ok(ModelSelection {
            model,
            requested: requested_text,
            fallback_reason,
        })
    }

    /// Requested models are used as given, since the upstream decides what
    /// exists. Unknown ones are only noted. With nothing requested the
    /// registry's models for `capability` are used in registry order.
    pub fn select_candidates(
        &self,
        requested: &[String],
        capability: &str,
    ) -> Result<CandidateSelection, String> {
        if let Ok(candidates) = ModelCandidates::new(requested) {
            let unknown = candidates
                .iter()
                .filter(|name| self.registry.ensure(name, capability).is_none())
                .map(|name| format!("'{name}'"))
                .collect::<Vec<_>>();
            let fallback_reason = if unknown.is_empty() {
                None
            } else {
                Some(format!(
                    "Models {} are not registered for capability '{capability}'; trying them anyway.",
                    unknown.join(", ")
                ))
            };
            return Ok(CandidateSelection {
                candidates,
                fallback_reason,
            });
        }

        let defaults = self
            .registry
            .by_capability(capability)
            .into_iter()
            .map(|model| model.name);
        let candidates = ModelCandidates::new(defaults)
            .map_err(|_| format!("No models available for capability '{capability}'."))?;
        Ok(CandidateSelection {
            candidates,
            fallback_reason: Some("No model specified; using default candidates.".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::models::{RENDER_CAPABILITY, VISION_CAPABILITY};

    fn render_model(name: &str) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            provider: "dryrun".to_string(),
            capabilities: vec!["render".to_string()],
            version: None,
        }
    }

    #[test]
    fn candidates_trim_dedup_and_strip_prefix() {
        let candidates =
            ModelCandidates::new(["models/gemini-1.5-pro", " gemini-1.5-pro ", "", "b"]).unwrap();
        assert_eq!(candidates.as_slice(), ["gemini-1.5-pro", "b"]);
        assert_eq!(
            ModelCandidates::new(Vec::<String>::new()).unwrap_err(),
            SynthesisError::NoCandidateModels
        );
    }

    #[test]
    fn preferred_models_move_to_front_once() {
        let candidates = ModelCandidates::new(["a", "b", "c"]).unwrap();
        let reordered = candidates.with_preferred(["c", "x"]);
        assert_eq!(reordered.as_slice(), ["c", "x", "a", "b"]);
        let unchanged = candidates.with_preferred(Vec::<String>::new());
        assert_eq!(unchanged, candidates);
    }

    #[test]
    fn model_selector_falls_back_when_requested_model_unavailable() {
        let mut models = IndexMap::new();
        models.insert("canny-fallback".to_string(), render_model("canny-fallback"));
        let selection = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(Some("missing"), RENDER_CAPABILITY)
            .unwrap();
        assert_eq!(selection.model.name, "canny-fallback");
        assert_eq!(selection.requested.as_deref(), Some("missing"));
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested model 'missing' unavailable for capability 'render'.")
        );
    }

    #[test]
    fn model_selector_raises_when_no_models_for_capability() {
        let mut models = IndexMap::new();
        models.insert("canny".to_string(), render_model("canny"));
        let err = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(None, VISION_CAPABILITY)
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No models available for capability 'vision'.");
    }

    #[test]
    fn candidate_selection_uses_registry_defaults_when_nothing_requested() {
        let selection = ModelSelector::new(None)
            .select_candidates(&[], VISION_CAPABILITY)
            .unwrap();
        assert_eq!(
            selection.candidates.as_slice(),
            ["gemini-1.5-flash", "gemini-1.5-pro", "gemini-pro-vision"]
        );
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("No model specified; using default candidates.")
        );
    }

    #[test]
    fn candidate_selection_keeps_unknown_requested_models() {
        let requested = vec!["gemini-2.0-flash".to_string(), "gemini-1.5-pro".to_string()];
        let selection = ModelSelector::new(None)
            .select_candidates(&requested, VISION_CAPABILITY)
            .unwrap();
        assert_eq!(
            selection.candidates.as_slice(),
            ["gemini-2.0-flash", "gemini-1.5-pro"]
        );
        assert!(selection
            .fallback_reason
            .unwrap_or_default()
            .contains("'gemini-2.0-flash'"));
    }
}
