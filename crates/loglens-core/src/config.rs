use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LoglensError, Result};
use crate::types::Capability;

/// Top-level loglens configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    pub model: ModelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

fn default_workspace() -> String { "~/.loglens".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for reasoning requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Which decision policy backs the supervisor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Deterministic checklist.
    #[default]
    Rules,
    /// Reasoning collaborator picks from the option set.
    Llm,
}

/// What the supervisor does when a proposed decision breaks a routing invariant.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GuardMode {
    /// Replace the decision with the next unmet requirement and note it in the history.
    #[default]
    Correct,
    /// Treat the violation as a supervisor error.
    Strict,
}

/// Orchestration engine and supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum node invocations per run. Default: 2 x workers + 1.
    #[serde(default)]
    pub step_budget: Option<usize>,
    /// Per-node timeout in seconds.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    #[serde(default)]
    pub policy: PolicyKind,
    #[serde(default)]
    pub guard: GuardMode,
    /// Capability classes that must contribute before FINISH.
    #[serde(default = "default_required")]
    pub required: Vec<Capability>,
    /// Upper bound on charts rendered per job.
    #[serde(default = "default_max_charts")]
    pub max_charts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_budget: None,
            node_timeout_secs: default_node_timeout(),
            policy: PolicyKind::default(),
            guard: GuardMode::default(),
            required: default_required(),
            max_charts: default_max_charts(),
        }
    }
}

fn default_node_timeout() -> u64 { 120 }
fn default_max_charts() -> usize { 2 }
fn default_required() -> Vec<Capability> {
    vec![
        Capability::Collection,
        Capability::Persistence,
        Capability::Analysis,
        Capability::Visualization,
    ]
}

/// Local persistence and object storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. Default: <workspace>/loglens.db
    #[serde(default)]
    pub database: Option<String>,
    /// Object store root. Default: <workspace>/objects
    #[serde(default)]
    pub objects_dir: Option<String>,
    /// URL prefix handed out for stored objects. Default: file:// paths.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    /// Lifetime of tokens issued by sign-in.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_minutes: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            api_keys: vec![],
            token_ttl_minutes: default_token_ttl(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:8700".to_string() }
fn default_token_ttl() -> i64 { 30 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub role: ApiKeyRole,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyRole {
    /// Read computers/tasks only
    Viewer,
    /// Read + submit jobs
    #[default]
    Operator,
    /// Full access
    Admin,
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary only, 2 = + decisions and node results, 3 = everything.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Config file unreadable");
            LoglensError::ConfigNotFound(path.display().to_string())
        })?;

        let expanded = expand_env_vars(&content);

        let config: Self = toml::from_str(&expanded).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Config file invalid");
            LoglensError::Config(e.to_string())
        })?;
        debug!(
            path = %path.display(),
            provider = %config.model.provider,
            policy = ?config.engine.policy,
            "Config loaded"
        );
        Ok(config)
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workspace)
    }

    pub fn database_path(&self) -> PathBuf {
        match self.storage.database {
            Some(ref p) => expand_home(p),
            None => self.workspace_dir().join("loglens.db"),
        }
    }

    pub fn objects_dir(&self) -> PathBuf {
        match self.storage.objects_dir {
            Some(ref p) => expand_home(p),
            None => self.workspace_dir().join("objects"),
        }
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match log.log_dir {
            Some(ref p) => expand_home(p),
            None => self.workspace_dir().join("logs"),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var("HOME").ok().map(PathBuf::from) {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => {
                    debug!(var = %var_name, "Config references unset env var");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
