//! Generation provider capabilities and their registry.

pub mod gemini;
mod http;
pub mod kie;
pub mod kling;
pub mod provider;
pub mod registry;
pub mod runway;

pub use gemini::GeminiImageProvider;
pub use kie::KieProvider;
pub use kling::{KlingEndpoint, KlingProvider};
pub use provider::{GenerationProvider, TEST_JOB_REASON};
pub use registry::ProviderRegistry;
pub use runway::RunwayProvider;
