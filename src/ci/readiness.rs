//! Health polling for freshly booted deployments

use crate::error::{YetiError, YetiResult};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Bounds for [`wait_until_ready`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    /// Path appended to the endpoint for each probe
    pub path: String,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    /// Per-probe request timeout
    pub probe_timeout_ms: u64,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            timeout_secs: 120,
            poll_interval_ms: 2_000,
            max_attempts: 60,
            probe_timeout_ms: 5_000,
        }
    }
}

impl ReadinessPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Poll `endpoint` until it answers with any status below 500.
///
/// The first probe is always sent; the deadline is only checked between
/// failed probes. Returns the number of probes it took. Fails with [`YetiError::Timeout`]
/// when the deadline passes, or [`YetiError::RetryLimitExceeded`] when the
/// attempt budget runs out first.
pub async fn wait_until_ready(endpoint: &str, policy: &ReadinessPolicy) -> YetiResult<u32> {
    let url = format!("{}{}", endpoint.trim_end_matches('/'), policy.path);
    let client = Client::builder()
        .timeout(Duration::from_millis(policy.probe_timeout_ms))
        .build()?;

    info!(
        "⏳ Waiting for {} to become ready (timeout: {}s, max attempts: {})",
        url, policy.timeout_secs, policy.max_attempts
    );

    let start_time = Instant::now();
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match client.get(&url).send().await {
            Ok(response) if !response.status().is_server_error() => {
                info!(
                    "✅ {} is ready (status {}, attempt {}/{})",
                    url,
                    response.status(),
                    attempt,
                    max_attempts
                );
                return Ok(attempt);
            }
            Ok(response) => {
                debug!(
                    "{} answered {} (attempt {}/{})",
                    url,
                    response.status(),
                    attempt,
                    max_attempts
                );
            }
            Err(e) => {
                debug!("{} not reachable yet: {} (attempt {}/{})", url, e, attempt, max_attempts);
            }
        }

        if attempt < max_attempts {
            if start_time.elapsed() >= policy.timeout() {
                warn!("❌ {} not ready after {}s", url, policy.timeout_secs);
                return Err(YetiError::timeout(
                    policy.timeout_secs,
                    format!("waiting for {} to become ready", url),
                ));
            }
            sleep(policy.poll_interval()).await;
        }
    }

    warn!("❌ {} never became ready", url);
    Err(YetiError::retry_limit_exceeded(
        max_attempts,
        format!("waiting for {} to become ready", url),
    ))
}
