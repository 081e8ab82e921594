use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use loglens_core::config::ModelConfig;
use loglens_core::error::{LoglensError, Result};
use loglens_core::traits::Reasoner;

use crate::presets::{get_preset, resolve_endpoint};

/// OpenAI-compatible chat completions. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiReasoner {
    http: Client,
    config: ModelConfig,
    endpoint: String,
}

impl OpenAiReasoner {
    pub fn new(config: ModelConfig) -> Self {
        let endpoint = resolve_endpoint(&config.provider, config.base_url.as_deref());
        Self {
            http: Client::new(),
            config,
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OaiMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct OaiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn build_request<'a>(config: &'a ModelConfig, prompt: &'a str, context: &'a str) -> ChatRequest<'a> {
    let mut messages = vec![OaiMessage {
        role: "system",
        content: prompt,
    }];
    if !context.is_empty() {
        messages.push(OaiMessage {
            role: "user",
            content: context,
        });
    }
    ChatRequest {
        model: &config.model_id,
        messages,
        max_tokens: config.max_tokens,
        temperature: if config.temperature > 0.0 {
            Some(config.temperature)
        } else {
            None
        },
        stream: false,
    }
}

fn parse_response(body: &str) -> Result<String> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| LoglensError::LlmParse(e.to_string()))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| LoglensError::LlmParse("response has no message content".to_string()))
}

impl Reasoner for OpenAiReasoner {
    fn reason(&self, prompt: &str, context: &str) -> BoxFuture<'_, Result<String>> {
        let body = build_request(&self.config, prompt, context);
        let body = serde_json::to_vec(&body);
        Box::pin(async move {
            let mut req = self
                .http
                .post(&self.endpoint)
                .header("content-type", "application/json")
                .body(body?);

            if let Some(api_key) = &self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }
            if let Some(preset) = get_preset(&self.config.provider) {
                for (k, v) in preset.extra_headers {
                    req = req.header(*k, *v);
                }
            }

            let response = req
                .send()
                .await
                .map_err(|e| LoglensError::LlmRequest(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| LoglensError::LlmRequest(e.to_string()))?;
            if !status.is_success() {
                return Err(LoglensError::LlmRequest(format!("HTTP {}: {}", status, text)));
            }
            debug!(model = %self.config.model_id, bytes = text.len(), "Chat completion received");
            parse_response(&text)
        })
    }
}
