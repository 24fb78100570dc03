use thiserror::Error;

/// Result type for request guard operations
pub type Result<T> = std::result::Result<T, GuardError>;

/// Errors that can occur in the request guard
#[derive(Error, Debug)]
pub enum GuardError {
    /// The counter/ban store did not answer: connection failure or timeout.
    /// The engine recovers from this by failing open.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Misconfigured rule: {0}")]
    MisconfiguredRule(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GuardError {
    /// Whether the error means the store could not be reached
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, GuardError::StoreUnavailable(_))
    }
}

impl From<config::ConfigError> for GuardError {
    fn from(err: config::ConfigError) -> Self {
        GuardError::Config(err.to_string())
    }
}
