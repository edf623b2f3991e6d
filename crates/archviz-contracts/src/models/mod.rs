mod cache;
mod registry;
mod selectors;

pub use cache::{DiscoveredModel, ModelCache};
pub use registry::{ModelRegistry, ModelSpec, RENDER_CAPABILITY, VISION_CAPABILITY};
pub use selectors::{CandidateSelection, ModelCandidates, ModelSelection, ModelSelector};
