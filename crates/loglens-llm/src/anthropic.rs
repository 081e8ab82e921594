use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use loglens_core::config::ModelConfig;
use loglens_core::error::{LoglensError, Result};
use loglens_core::traits::Reasoner;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API; the prompt goes in `system`, the context as the user turn.
pub struct AnthropicReasoner {
    http: Client,
    config: ModelConfig,
}

impl AnthropicReasoner {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    system: &'a str,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize, Debug)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

fn build_request<'a>(
    config: &'a ModelConfig,
    prompt: &'a str,
    context: &'a str,
) -> MessagesRequest<'a> {
    // The API rejects an empty user turn.
    let content = if context.is_empty() { "Proceed." } else { context };
    MessagesRequest {
        model: &config.model_id,
        max_tokens: config.max_tokens,
        temperature: if config.temperature > 0.0 {
            Some(config.temperature)
        } else {
            None
        },
        system: prompt,
        messages: vec![ApiMessage {
            role: "user",
            content,
        }],
    }
}

fn parse_response(body: &str) -> Result<String> {
    let response: MessagesResponse =
        serde_json::from_str(body).map_err(|e| LoglensError::LlmParse(e.to_string()))?;
    let text: String = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() {
        return Err(LoglensError::LlmParse(
            "response has no text content".to_string(),
        ));
    }
    Ok(text)
}

impl Reasoner for AnthropicReasoner {
    fn reason(&self, prompt: &str, context: &str) -> BoxFuture<'_, Result<String>> {
        let body = serde_json::to_vec(&build_request(&self.config, prompt, context));
        Box::pin(async move {
            let url = self.config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);
            let api_key = self.config.api_key.as_deref().ok_or_else(|| {
                LoglensError::Config("anthropic provider requires model.api_key".to_string())
            })?;

            let response = self
                .http
                .post(url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .body(body?)
                .send()
                .await
                .map_err(|e| LoglensError::LlmRequest(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| LoglensError::LlmRequest(e.to_string()))?;
            if !status.is_success() {
                return Err(LoglensError::LlmRequest(format!(
                    "Anthropic API error {}: {}",
                    status, text
                )));
            }
            debug!(model = %self.config.model_id, bytes = text.len(), "Message received");
            parse_response(&text)
        })
    }
}
