/// Endpoint defaults for OpenAI-compatible providers.
pub struct ProviderPreset {
    pub default_base_url: &'static str,
    pub needs_api_key: bool,
    pub extra_headers: &'static [(&'static str, &'static str)],
}

pub const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Look up a provider preset by name.
pub fn get_preset(provider: &str) -> Option<ProviderPreset> {
    match provider {
        "openai" => Some(ProviderPreset {
            default_base_url: OPENAI_API_URL,
            needs_api_key: true,
            extra_headers: &[],
        }),
        "ollama" => Some(ProviderPreset {
            default_base_url: "http://localhost:11434/v1/chat/completions",
            needs_api_key: false,
            extra_headers: &[],
        }),
        "groq" => Some(ProviderPreset {
            default_base_url: "https://api.groq.com/openai/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[],
        }),
        "openrouter" => Some(ProviderPreset {
            default_base_url: "https://openrouter.ai/api/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[("X-Title", "loglens")],
        }),
        "mistral" => Some(ProviderPreset {
            default_base_url: "https://api.mistral.ai/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[],
        }),
        "deepseek" => Some(ProviderPreset {
            default_base_url: "https://api.deepseek.com/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[],
        }),
        _ => None,
    }
}

/// Chat-completions URL for a provider: explicit override, then preset, then OpenAI.
pub fn resolve_endpoint(provider: &str, base_url: Option<&str>) -> String {
    if let Some(url) = base_url {
        return url.to_string();
    }
    get_preset(provider)
        .map(|p| p.default_base_url)
        .unwrap_or(OPENAI_API_URL)
        .to_string()
}

/// List all known preset provider names.
pub fn all_preset_names() -> &'static [&'static str] {
    &["openai", "ollama", "groq", "openrouter", "mistral", "deepseek"]
}
