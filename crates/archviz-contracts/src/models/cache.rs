use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Outcome of the one-off model discovery for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DiscoveredModel {
    #[default]
    Unknown,
    Found(String),
    NotFound,
}

#[derive(Debug, Default)]
struct CacheSlots {
    last_good: Option<String>,
    discovered: DiscoveredModel,
}

/// Session-owned memory of which vision models worked.
///
/// Owned by the host session and handed to the synthesizer by reference.
/// Read-mostly; concurrent writers resolve as last write wins.
#[derive(Debug, Default)]
pub struct ModelCache {
    slots: RwLock<CacheSlots>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_good(&self) -> Option<String> {
        self.read().last_good.clone()
    }

    pub fn remember_success(&self, model: &str) {
        let trimmed = model.trim();
        if trimmed.is_empty() {
            return;
        }
        self.write().last_good = Some(trimmed.to_string());
    }

    pub fn forget_last_good(&self) {
        self.write().last_good = None;
    }

    pub fn discovered(&self) -> DiscoveredModel {
        self.read().discovered.clone()
    }

    pub fn set_discovered(&self, discovered: DiscoveredModel) {
        self.write().discovered = discovered;
    }

    /// Models to try ahead of the caller's candidates: last good first, then
    /// the discovered one.
    pub fn preferred_models(&self) -> Vec<String> {
        let slots = self.read();
        let mut out = Vec::new();
        if let Some(model) = slots.last_good.as_ref() {
            out.push(model.clone());
        }
        if let DiscoveredModel::Found(model) = &slots.discovered {
            if !out.contains(model) {
                out.push(model.clone());
            }
        }
        out
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheSlots> {
        self.slots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheSlots> {
        self.slots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn starts_empty() {
        let cache = ModelCache::new();
        assert_eq!(cache.last_good(), None);
        assert_eq!(cache.discovered(), DiscoveredModel::Unknown);
        assert!(cache.preferred_models().is_empty());
    }

    #[test]
    fn preferred_models_put_last_good_before_discovered() {
        let cache = ModelCache::new();
        cache.set_discovered(DiscoveredModel::Found("gemini-1.5-flash".to_string()));
        cache.remember_success("gemini-1.5-pro");
        assert_eq!(
            cache.preferred_models(),
            vec!["gemini-1.5-pro", "gemini-1.5-flash"]
        );

        cache.remember_success("gemini-1.5-flash");
        assert_eq!(cache.preferred_models(), vec!["gemini-1.5-flash"]);

        cache.forget_last_good();
        cache.set_discovered(DiscoveredModel::NotFound);
        assert!(cache.preferred_models().is_empty());
    }

    #[test]
    fn blank_success_is_ignored() {
        let cache = ModelCache::new();
        cache.remember_success("   ");
        assert_eq!(cache.last_good(), None);
    }

    #[test]
    fn concurrent_writers_leave_one_of_their_values() {
        let cache = Arc::new(ModelCache::new());
        let handles = (0..8)
            .map(|idx| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.remember_success(&format!("model-{idx}")))
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        let winner = cache.last_good().unwrap();
        assert!(winner.starts_with("model-"));
    }
}
