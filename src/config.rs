//! Client configuration loaded from the environment or a YAML file

use crate::error::{YetiError, YetiResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENDPOINT_VAR: &str = "YETI_ENDPOINT";
pub const API_KEY_VAR: &str = "YETI_API_KEY";
pub const TIMEOUT_VAR: &str = "YETI_TIMEOUT_SECS";
pub const AUTH_RETRIES_VAR: &str = "YETI_AUTH_RETRIES";

/// Retry behaviour for transport errors and 5xx responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add up to 25% jitter to each delay
    pub enable_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            enable_jitter: false,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            enable_jitter: false,
        }
    }

    /// Fixed delay between a given number of attempts
    pub fn fixed_delay(attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_multiplier: 1.0,
            enable_jitter: false,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let delay_ms = base.min(self.max_delay_ms as f64) as u64;

        if self.enable_jitter {
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            Duration::from_millis(delay_ms + jitter)
        } else {
            Duration::from_millis(delay_ms)
        }
    }
}

/// Configuration for [`crate::api::YetiApi`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Root URL of the Yeti deployment, e.g. `http://localhost:80`
    pub endpoint: String,
    /// Long-lived API key exchanged for access tokens
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// How many times a 401 triggers re-authentication before giving up
    #[serde(default = "default_auth_retries")]
    pub auth_retries: u32,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_auth_retries() -> u32 {
    3
}

impl ClientConfig {
    pub fn new<S: Into<String>>(endpoint: S) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            request_timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
            auth_retries: default_auth_retries(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Load configuration from the process environment (and `.env` when present)
    pub fn from_env() -> YetiResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> YetiResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = lookup(ENDPOINT_VAR)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| YetiError::configuration(format!("{} must be set", ENDPOINT_VAR)))?;

        let mut config = Self::new(endpoint);
        config.api_key = lookup(API_KEY_VAR).filter(|v| !v.is_empty());
        config.apply_overrides(lookup)?;

        config.validate()?;
        Ok(config)
    }

    /// Apply the request timeout and auth retry variables on top of an
    /// existing configuration. Unset variables leave the field untouched.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> YetiResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(timeout) = lookup(TIMEOUT_VAR).filter(|v| !v.trim().is_empty()) {
            self.request_timeout_secs = timeout.trim().parse().map_err(|_| {
                YetiError::configuration(format!("{} must be a number", TIMEOUT_VAR))
            })?;
        }

        if let Some(retries) = lookup(AUTH_RETRIES_VAR).filter(|v| !v.trim().is_empty()) {
            self.auth_retries = retries.trim().parse().map_err(|_| {
                YetiError::configuration(format!("{} must be a number", AUTH_RETRIES_VAR))
            })?;
        }

        Ok(())
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> YetiResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            YetiError::configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: ClientConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject endpoints that are not absolute http(s) URLs
    pub fn validate(&self) -> YetiResult<()> {
        let parsed = url::Url::parse(&self.endpoint).map_err(|e| {
            YetiError::configuration(format!("Invalid endpoint '{}': {}", self.endpoint, e))
        })?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(YetiError::configuration(format!(
                    "Unsupported endpoint scheme '{}'",
                    other
                )))
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(YetiError::configuration("retry.max_attempts must be at least 1"));
        }

        Ok(())
    }
}
