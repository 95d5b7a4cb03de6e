//! Error types for the Yeti client and CI harness

use thiserror::Error;

/// Main error type for Yeti API and pipeline operations
#[derive(Debug, Error)]
pub enum YetiError {
    #[error("API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Non-2xx response other than 401 (and 404 where a lookup maps it to `None`)
    #[error("Yeti API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("{0}")]
    Auth(String),

    #[error("Failed to find access token in the response: {0}")]
    MissingAccessToken(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timeout exceeded after {seconds}s: {operation}")]
    Timeout { seconds: u64, operation: String },

    #[error("Retry limit exceeded: {attempts} attempts failed for {operation}")]
    RetryLimitExceeded { attempts: u32, operation: String },

    #[error("Command `{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("API key extraction failed: {0}")]
    KeyExtraction(String),

    #[error("Missing secret: {0} is unset or empty")]
    MissingSecret(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type alias for Yeti operations
pub type YetiResult<T> = Result<T, YetiError>;

impl YetiError {
    /// Create a new API status error
    pub fn api<S: Into<String>>(status: u16, message: S) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create the error raised once 401 refreshes are exhausted
    pub fn unauthorized(url: &str) -> Self {
        Self::Auth(format!("401 Client Error: Unauthorized for url: {}", url))
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(seconds: u64, operation: S) -> Self {
        Self::Timeout {
            seconds,
            operation: operation.into(),
        }
    }

    /// Create a new retry limit exceeded error
    pub fn retry_limit_exceeded<S: Into<String>>(attempts: u32, operation: S) -> Self {
        Self::RetryLimitExceeded {
            attempts,
            operation: operation.into(),
        }
    }

    pub fn command_failed<C: Into<String>, S: Into<String>>(
        command: C,
        status: i32,
        stderr: S,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            status,
            stderr: stderr.into(),
        }
    }

    pub fn key_extraction<S: Into<String>>(message: S) -> Self {
        Self::KeyExtraction(message.into())
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    /// HTTP status carried by the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Auth(_) => Some(401),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }
}
