use thiserror::Error;

/// Top-level error type for every fallible Thrall operation.
#[derive(Debug, Error)]
pub enum ThrallError {
    #[error("config error: {0}")]
    Config(#[from] crate::config_loader::ConfigError),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("template error: missing key {0}")]
    TemplateMissingKey(String),

    #[error("llm evaluator error: {0}")]
    Llm(String),

    #[error("action step failed: {step}: {reason}")]
    Action { step: String, reason: String },

    #[error("breaker error: {0}")]
    Breaker(String),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ThrallError>;
