pub mod anthropic;
pub mod openai;
pub mod presets;
pub mod retry;

use std::sync::Arc;

use loglens_core::config::ModelConfig;
use loglens_core::traits::Reasoner;

pub use anthropic::AnthropicReasoner;
pub use openai::OpenAiReasoner;
pub use retry::RetryingReasoner;

/// Create a reasoner for the configured provider, wrapped in retries.
pub fn create_reasoner(config: &ModelConfig) -> Arc<dyn Reasoner> {
    let inner: Box<dyn Reasoner> = match config.provider.as_str() {
        "anthropic" | "claude" => Box::new(AnthropicReasoner::new(config.clone())),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiReasoner::new(config.clone())),
    };
    Arc::new(RetryingReasoner::new(
        inner,
        config.retry.clone().unwrap_or_default(),
    ))
}
