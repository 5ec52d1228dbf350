use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvoyError {
    #[error("Store error: {0}")]
    Store(String),

    /// A compare-and-swap write lost against a concurrent writer.
    #[error("Write conflict on {0}, will wait and retry")]
    Conflict(String),

    #[error("Definition error: {0}")]
    Definition(String),

    #[error("Operation {name} failed: {message}")]
    Operation { name: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ConvoyError {
    pub fn operation(name: impl Into<String>, message: impl Into<String>) -> Self {
        ConvoyError::Operation {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Conflicts are resolved by retrying, every other error is surfaced.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConvoyError::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, ConvoyError>;
