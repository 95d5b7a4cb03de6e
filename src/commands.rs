use anyhow::{anyhow, Context, Result};
use colored::*;
use std::path::{Path, PathBuf};
use yeti::api::{object_ref, IndicatorQuery, YetiApi, YetiObject};
use yeti::ci::{
    provision_admin_key, wait_until_ready, ExecutionEnvironment, KeyProvisioning,
    ReadinessPolicy, StepStatus, SystemCommandRunner, Trigger, Workflow, WorkflowOutcome,
};
use yeti::config::ClientConfig;

/// Connection settings gathered from global flags
pub struct Connection {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub config: Option<PathBuf>,
}

impl Connection {
    fn client_config(&self) -> Result<ClientConfig> {
        self.client_config_with(|key| std::env::var(key).ok())
    }

    /// Flags win over the config file; `lookup` supplies the timeout and
    /// auth retry variables.
    fn client_config_with<F>(&self, lookup: F) -> Result<ClientConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match (&self.config, &self.endpoint) {
            (Some(path), _) => ClientConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            (None, Some(endpoint)) => ClientConfig::new(endpoint.clone()),
            (None, None) => {
                return Err(anyhow!(
                    "No endpoint configured; pass --endpoint or set YETI_ENDPOINT"
                ))
            }
        };

        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(key) = &self.api_key {
            config.api_key = Some(key.clone());
        }
        config.apply_overrides(lookup)?;

        config.validate()?;
        Ok(config)
    }

    fn endpoint(&self) -> Result<String> {
        Ok(self.client_config()?.endpoint)
    }

    /// A client, authenticated when an API key is available
    async fn client(&self) -> Result<YetiApi> {
        let config = self.client_config()?;
        let api_key = config.api_key.clone();
        let api = YetiApi::with_config(config)?;

        if let Some(key) = api_key {
            api.auth_api_key(Some(&key))
                .await
                .context("Authentication failed")?;
        }
        Ok(api)
    }
}

fn describe(object: &YetiObject) -> String {
    let name = object
        .get("name")
        .or_else(|| object.get("value"))
        .and_then(|v| v.as_str())
        .unwrap_or("<unnamed>");
    match object_ref(object) {
        Ok(reference) => format!("{} ({})", name, reference.dimmed()),
        Err(_) => name.to_string(),
    }
}

fn indicator_query(name: Option<String>, indicator_type: String) -> IndicatorQuery {
    IndicatorQuery {
        name,
        indicator_type: Some(indicator_type),
        ..IndicatorQuery::default()
    }
}

pub async fn search_indicators(
    connection: &Connection,
    name: Option<String>,
    indicator_type: String,
) -> Result<bool> {
    let api = connection.client().await?;
    let query = indicator_query(name, indicator_type);

    let indicators = api.search_indicators(&query).await?;
    for indicator in &indicators {
        if let Some(name) = indicator.get("name").and_then(|v| v.as_str()) {
            println!("{}", name);
        }
    }
    Ok(true)
}

pub async fn find_indicator(
    connection: &Connection,
    name: &str,
    indicator_type: &str,
) -> Result<bool> {
    let api = connection.client().await?;

    match api.find_indicator(name, indicator_type).await? {
        Some(indicator) => {
            println!("{}", serde_json::to_string_pretty(&indicator)?);
            Ok(true)
        }
        None => {
            println!(
                "{} No {} indicator named {}",
                "✗".red().bold(),
                indicator_type,
                name.cyan()
            );
            Ok(false)
        }
    }
}

pub async fn add_observable(
    connection: &Connection,
    value: &str,
    observable_type: &str,
    tags: &[String],
) -> Result<bool> {
    let api = connection.client().await?;

    let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
    let tags = if tags.is_empty() { None } else { Some(tags.as_slice()) };

    let observable = api.add_observable(value, observable_type, tags).await?;
    println!("{} Added {}", "✓".green().bold(), describe(&observable));
    Ok(true)
}

pub async fn search_bloom(connection: &Connection, values: &[String]) -> Result<bool> {
    let api = connection.client().await?;

    let values: Vec<&str> = values.iter().map(String::as_str).collect();
    let hits = api.search_bloom(&values).await?;

    if hits.is_empty() {
        println!("{} No bloom filter hits", "→".yellow());
    }
    for hit in hits {
        println!("{} {}: {}", "●".green(), hit.value.cyan(), hit.hits.join(", "));
    }
    Ok(true)
}

pub async fn run_workflow(path: &Path, event: Trigger, workdir: PathBuf) -> Result<bool> {
    let workflow = Workflow::from_file(path)
        .with_context(|| format!("Failed to load workflow {}", path.display()))?;
    let exec = ExecutionEnvironment::from_process(workdir);

    let reports = match workflow.handle(event, &exec).await {
        WorkflowOutcome::Skipped => {
            println!(
                "{} Workflow '{}' is not triggered by {}",
                "→".yellow(),
                workflow.name,
                event
            );
            return Ok(true);
        }
        WorkflowOutcome::Completed(reports) => reports,
    };

    println!("{} Workflow '{}' results:", "📊".green().bold(), workflow.name);
    for report in &reports {
        let label = match &report.matrix {
            Some(entry) => format!("{} [{}]", report.job, entry),
            None => report.job.clone(),
        };
        let status = if report.success() {
            "passed".green().bold()
        } else {
            "failed".red().bold()
        };
        println!(
            "  {} {} ({}ms)",
            label,
            status,
            report.duration().num_milliseconds()
        );

        for step in &report.steps {
            let marker = match step.status {
                StepStatus::Success => "✓".green(),
                StepStatus::Failed => "✗".red(),
                StepStatus::Skipped => "-".dimmed(),
            };
            println!("    {} {}", marker, step.name);
            if let Some(error) = &step.error {
                println!("      {}", error.red());
            }
        }
    }

    Ok(reports.iter().all(|r| r.success()))
}

/// Enough attempts to cover the whole timeout at the given interval
fn readiness_policy(timeout_secs: u64, interval_ms: u64) -> ReadinessPolicy {
    let attempts = (timeout_secs.saturating_mul(1000) / interval_ms.max(1)).max(1);
    ReadinessPolicy {
        timeout_secs,
        poll_interval_ms: interval_ms,
        max_attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        ..ReadinessPolicy::default()
    }
}

pub async fn wait_ready(connection: &Connection, timeout_secs: u64, interval_ms: u64) -> Result<bool> {
    let endpoint = connection.endpoint()?;
    let policy = readiness_policy(timeout_secs, interval_ms);

    let attempts = wait_until_ready(&endpoint, &policy).await?;
    println!(
        "{} {} is ready after {} attempt(s)",
        "✓".green().bold(),
        endpoint.cyan(),
        attempts
    );
    Ok(true)
}

pub async fn provision_key(compose_dir: PathBuf, user: String, password: String) -> Result<bool> {
    let provisioning = KeyProvisioning {
        compose_dir,
        username: user,
        password,
        ..KeyProvisioning::default()
    };

    let key = provision_admin_key(&SystemCommandRunner, &provisioning).await?;
    println!("{}", key.as_str());
    Ok(true)
}
