//! Admin user creation and API key extraction

use crate::ci::runner::{CommandRunner, CommandSpec};
use crate::error::{YetiError, YetiResult};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// A validated Yeti API key
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Accept only non-empty ASCII alphanumerics plus `-`, `_` and `.`
    pub fn parse<S: AsRef<str>>(raw: S) -> YetiResult<Self> {
        let raw = raw.as_ref().trim();
        if raw.is_empty() {
            return Err(YetiError::key_extraction("extracted API key is empty"));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(YetiError::key_extraction(format!(
                "extracted API key contains unexpected character {:?}",
                bad
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey(<{} chars>)", self.0.len())
    }
}

/// Extract an API key from `create-user` output.
///
/// A JSON object line with a string `api_key` field wins. Otherwise the text
/// following the first `"<username>:"` on a line, up to the next whitespace,
/// is used.
pub fn extract_api_key(output: &str, username: &str) -> YetiResult<ApiKey> {
    for line in output.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) {
            if let Some(key) = map.get("api_key").and_then(Value::as_str) {
                debug!("Found structured api_key in create-user output");
                return ApiKey::parse(key);
            }
        }
    }

    let delimiter = format!("{}:", username);
    let candidate = output
        .lines()
        .filter_map(|line| line.split_once(delimiter.as_str()).map(|(_, rest)| rest))
        .map(|rest| rest.split_whitespace().next().unwrap_or(""))
        .find(|token| !token.is_empty());

    match candidate {
        Some(token) => ApiKey::parse(token),
        None => Err(YetiError::key_extraction(format!(
            "no JSON api_key and no '{}' delimiter in create-user output",
            delimiter
        ))),
    }
}

/// Parameters for creating the admin test user inside a compose deployment
#[derive(Debug, Clone, PartialEq)]
pub struct KeyProvisioning {
    /// Directory holding the deployment's compose file
    pub compose_dir: PathBuf,
    /// Compose service that carries the Yeti CLI
    pub service: String,
    pub username: String,
    pub password: String,
}

impl Default for KeyProvisioning {
    fn default() -> Self {
        Self {
            compose_dir: PathBuf::from("yeti-docker/prod"),
            service: "api".to_string(),
            username: "test".to_string(),
            password: "test".to_string(),
        }
    }
}

impl KeyProvisioning {
    /// `docker compose run --rm <service> create-user <user> <password> --admin`
    pub fn command(&self) -> CommandSpec {
        CommandSpec::new("docker")
            .args(["compose", "run", "--rm"])
            .arg(self.service.as_str())
            .arg("create-user")
            .arg(self.username.as_str())
            .arg(self.password.as_str())
            .arg("--admin")
            .current_dir(self.compose_dir.clone())
    }
}

/// Create the admin user and return its validated API key
pub async fn provision_admin_key(
    runner: &dyn CommandRunner,
    provisioning: &KeyProvisioning,
) -> YetiResult<ApiKey> {
    info!(
        "🔑 Creating admin user '{}' via compose service '{}'",
        provisioning.username, provisioning.service
    );

    let spec = provisioning.command();
    let output = runner.run(&spec).await?.check(&spec)?;

    match extract_api_key(&output.stdout, &provisioning.username) {
        Ok(key) => {
            info!("✅ API key provisioned for '{}'", provisioning.username);
            Ok(key)
        }
        Err(e) => {
            warn!("❌ Could not extract API key: {}", e);
            Err(e)
        }
    }
}
