pub mod config;
pub mod discovery;
pub mod render;
pub mod session;
pub mod synthesizer;
pub mod transport;

pub use config::EngineConfig;
pub use discovery::{DiscoveryError, ModelDiscovery};
pub use render::{DryrunRenderer, ImageRenderer, RenderError, RendererRegistry, ReplicateRenderer};
pub use session::{new_session_id, StudioSession};
pub use synthesizer::{backoff_delay, PromptSynthesizer, SynthesisState, MAX_ATTEMPTS_PER_MODEL};
pub use transport::{Auth, HttpReply, HttpTransport, Pause, ReqwestTransport, ThreadPause};
