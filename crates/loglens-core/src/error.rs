use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoglensError {
    // Reasoning errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Worker errors
    #[error("Worker failed: {worker}: {message}")]
    Worker { worker: String, message: String },

    #[error("Worker timeout after {timeout_secs}s: {worker}")]
    WorkerTimeout { worker: String, timeout_secs: u64 },

    // Graph errors
    #[error("Graph assembly failed: {0}")]
    Graph(String),

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Collaborator errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Log source error: {0}")]
    LogSource(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LoglensError>;
