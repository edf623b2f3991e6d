use indexmap::IndexMap;

pub const VISION_CAPABILITY: &str = "vision";
pub const RENDER_CAPABILITY: &str = "render";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    /// Pinned upstream version, for providers that address models by hash.
    pub version: Option<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }

    /// `owner/name:version` when a version is pinned, otherwise the bare name.
    pub fn reference(&self) -> String {
        match self.version.as_deref() {
            Some(version) => format!("{}:{version}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name.trim())
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, capabilities: &[&str], version: Option<&str>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                version: version.map(str::to_string),
            },
        );
    };

    insert("gemini-1.5-flash", "gemini", &["text", "vision"], None);
    insert("gemini-1.5-pro", "gemini", &["text", "vision"], None);
    insert("gemini-pro-vision", "gemini", &["vision"], None);
    insert(
        "jagilley/controlnet-canny",
        "replicate",
        &["render"],
        Some("aff48af9c68d162388d230a2ab003f68d2638d88307bdaf1c2f1ac95079c9613"),
    );
    insert("dryrun-render", "dryrun", &["render"], None);

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_vision_models_keep_preference_order() {
        let names = ModelRegistry::new(None)
            .by_capability(VISION_CAPABILITY)
            .into_iter()
            .map(|model| model.name)
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["gemini-1.5-flash", "gemini-1.5-pro", "gemini-pro-vision"]
        );
    }

    #[test]
    fn render_model_reference_includes_pinned_version() {
        let registry = ModelRegistry::new(None);
        let canny = registry
            .ensure("jagilley/controlnet-canny", RENDER_CAPABILITY)
            .unwrap();
        assert_eq!(canny.provider, "replicate");
        assert_eq!(
            canny.reference(),
            "jagilley/controlnet-canny:aff48af9c68d162388d230a2ab003f68d2638d88307bdaf1c2f1ac95079c9613"
        );
        assert!(registry.ensure("gemini-1.5-pro", RENDER_CAPABILITY).is_none());
        assert_eq!(
            registry.get("dryrun-render").map(ModelSpec::reference).as_deref(),
            Some("dryrun-render")
        );
    }
}
