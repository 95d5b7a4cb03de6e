//! Typed pipeline steps and their YAML form

use crate::ci::deployment::DeploymentBootstrap;
use crate::ci::keys::{provision_admin_key, KeyProvisioning};
use crate::ci::readiness::{wait_until_ready, ReadinessPolicy};
use crate::ci::runner::{CommandRunner, CommandSpec};
use crate::config::{API_KEY_VAR, ENDPOINT_VAR};
use crate::error::{YetiError, YetiResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Env var a bootstrap step sets to the deployment's compose directory
pub const COMPOSE_DIR_VAR: &str = "YETI_COMPOSE_DIR";
pub const DEFAULT_PUBLISH_TOKEN_VAR: &str = "PYPI_TOKEN";

/// Mutable state threaded through the steps of one job run
pub struct JobContext {
    /// Job-scoped environment; later steps see what earlier ones set
    pub env: HashMap<String, String>,
    pub workdir: PathBuf,
    pub runner: Arc<dyn CommandRunner>,
}

impl JobContext {
    pub fn new<P: Into<PathBuf>>(workdir: P, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            env: HashMap::new(),
            workdir: workdir.into(),
            runner,
        }
    }

    pub fn set_env<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.env.insert(key.into(), value.into());
    }

    /// A variable that must be present and non-empty
    pub fn require_env(&self, key: &str) -> YetiResult<&str> {
        self.env
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                YetiError::configuration(format!("{} is not set in the job environment", key))
            })
    }

    /// Resolve a possibly relative path against the job working directory
    pub fn resolve(&self, path: &std::path::Path) -> PathBuf {
        if path.is_relative() {
            self.workdir.join(path)
        } else {
            path.to_path_buf()
        }
    }

    fn shell(&self, command: &str) -> CommandSpec {
        CommandSpec::shell(command)
            .current_dir(self.workdir.clone())
            .envs(&self.env)
    }
}

/// One unit of work inside a job
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, ctx: &mut JobContext) -> YetiResult<()>;
}

/// Run a shell command; used for dependency installs and test execution
pub struct RunStep {
    pub name: String,
    pub command: String,
    pub env: HashMap<String, String>,
}

#[async_trait]
impl Step for RunStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut JobContext) -> YetiResult<()> {
        let spec = ctx.shell(&self.command).envs(&self.env);
        let output = ctx.runner.run(&spec).await?.check(&spec)?;
        if !output.stdout.is_empty() {
            info!("{}", output.stdout.trim_end());
        }
        Ok(())
    }
}

/// Clone and boot the external deployment
pub struct BootstrapStep {
    pub name: String,
    pub deployment: DeploymentBootstrap,
}

#[async_trait]
impl Step for BootstrapStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut JobContext) -> YetiResult<()> {
        let deployment = self.deployment.rooted_at(&ctx.workdir);
        let compose_dir = deployment.bootstrap(ctx.runner.as_ref()).await?;
        ctx.set_env(COMPOSE_DIR_VAR, compose_dir.to_string_lossy().to_string());
        Ok(())
    }
}

/// Poll the deployment until it answers
pub struct WaitReadyStep {
    pub name: String,
    /// Falls back to `YETI_ENDPOINT` from the job environment
    pub endpoint: Option<String>,
    pub policy: ReadinessPolicy,
}

#[async_trait]
impl Step for WaitReadyStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut JobContext) -> YetiResult<()> {
        let endpoint = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => ctx.require_env(ENDPOINT_VAR)?.to_string(),
        };
        wait_until_ready(&endpoint, &self.policy).await?;
        Ok(())
    }
}

/// Create the admin user and export its API key into the job environment
pub struct ProvisionKeyStep {
    pub name: String,
    /// `compose_dir` is replaced by the bootstrap output when one exists
    pub provisioning: KeyProvisioning,
    pub compose_dir_override: Option<PathBuf>,
    pub export_as: String,
}

#[async_trait]
impl Step for ProvisionKeyStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut JobContext) -> YetiResult<()> {
        let mut provisioning = self.provisioning.clone();
        provisioning.compose_dir = match (&self.compose_dir_override, ctx.env.get(COMPOSE_DIR_VAR)) {
            (Some(dir), _) => ctx.resolve(dir),
            (None, Some(dir)) => PathBuf::from(dir),
            (None, None) => ctx.resolve(&provisioning.compose_dir),
        };

        let key = provision_admin_key(ctx.runner.as_ref(), &provisioning).await?;
        ctx.set_env(self.export_as.clone(), key.into_inner());
        Ok(())
    }
}

/// Build and upload a release; refuses to run without its token
pub struct PublishStep {
    pub name: String,
    pub command: String,
    /// Job env var holding the secret
    pub token_var: String,
    /// Env var the publish command reads the secret from
    pub forward_as: String,
}

#[async_trait]
impl Step for PublishStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut JobContext) -> YetiResult<()> {
        let token = ctx
            .env
            .get(&self.token_var)
            .filter(|t| !t.trim().is_empty())
            .cloned()
            .ok_or_else(|| YetiError::MissingSecret(self.token_var.clone()))?;

        info!("📦 Publishing with `{}`", self.command);
        let spec = ctx.shell(&self.command).env(self.forward_as.clone(), token);
        ctx.runner.run(&spec).await?.check(&spec)?;
        Ok(())
    }
}

/// YAML representation of a step, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepSpec {
    Run {
        name: Option<String>,
        run: String,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Bootstrap {
        name: Option<String>,
        #[serde(default)]
        deployment: DeploymentBootstrap,
    },
    WaitReady {
        name: Option<String>,
        endpoint: Option<String>,
        #[serde(default)]
        policy: ReadinessPolicy,
    },
    ProvisionKey {
        name: Option<String>,
        username: Option<String>,
        password: Option<String>,
        service: Option<String>,
        compose_dir: Option<PathBuf>,
        export_as: Option<String>,
    },
    Publish {
        name: Option<String>,
        run: String,
        token_var: Option<String>,
        forward_as: Option<String>,
    },
}

impl StepSpec {
    pub fn into_step(self) -> Box<dyn Step> {
        match self {
            StepSpec::Run { name, run, env } => Box::new(RunStep {
                name: name.unwrap_or_else(|| run.clone()),
                command: run,
                env,
            }),
            StepSpec::Bootstrap { name, deployment } => Box::new(BootstrapStep {
                name: name.unwrap_or_else(|| "Bootstrap deployment".to_string()),
                deployment,
            }),
            StepSpec::WaitReady {
                name,
                endpoint,
                policy,
            } => Box::new(WaitReadyStep {
                name: name.unwrap_or_else(|| "Wait for deployment".to_string()),
                endpoint,
                policy,
            }),
            StepSpec::ProvisionKey {
                name,
                username,
                password,
                service,
                compose_dir,
                export_as,
            } => {
                let defaults = KeyProvisioning::default();
                Box::new(ProvisionKeyStep {
                    name: name.unwrap_or_else(|| "Provision API key".to_string()),
                    provisioning: KeyProvisioning {
                        compose_dir: defaults.compose_dir,
                        service: service.unwrap_or(defaults.service),
                        username: username.unwrap_or(defaults.username),
                        password: password.unwrap_or(defaults.password),
                    },
                    compose_dir_override: compose_dir,
                    export_as: export_as.unwrap_or_else(|| API_KEY_VAR.to_string()),
                })
            }
            StepSpec::Publish {
                name,
                run,
                token_var,
                forward_as,
            } => {
                let token_var =
                    token_var.unwrap_or_else(|| DEFAULT_PUBLISH_TOKEN_VAR.to_string());
                Box::new(PublishStep {
                    name: name.unwrap_or_else(|| "Publish".to_string()),
                    command: run,
                    forward_as: forward_as.unwrap_or_else(|| token_var.clone()),
                    token_var,
                })
            }
        }
    }
}
