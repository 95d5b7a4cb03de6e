//! Cloning and booting an external docker-compose deployment of Yeti

use crate::ci::runner::{CommandRunner, CommandSpec};
use crate::error::YetiResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_DEPLOYMENT_REPO: &str = "https://github.com/yeti-platform/yeti-docker";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentBootstrap {
    pub repo_url: String,
    /// Where the deployment repository is cloned to
    pub checkout_dir: PathBuf,
    /// Directory inside the checkout holding the compose file and init script
    pub compose_subdir: PathBuf,
    pub init_script: String,
    pub clone_depth: Option<u32>,
}

impl Default for DeploymentBootstrap {
    fn default() -> Self {
        Self {
            repo_url: DEFAULT_DEPLOYMENT_REPO.to_string(),
            checkout_dir: PathBuf::from("yeti-docker"),
            compose_subdir: PathBuf::from("prod"),
            init_script: "./init.sh".to_string(),
            clone_depth: Some(1),
        }
    }
}

impl DeploymentBootstrap {
    pub fn compose_dir(&self) -> PathBuf {
        self.checkout_dir.join(&self.compose_subdir)
    }

    /// Resolve checkout paths against a job working directory
    pub fn rooted_at(&self, root: &Path) -> Self {
        let mut rooted = self.clone();
        if rooted.checkout_dir.is_relative() {
            rooted.checkout_dir = root.join(&rooted.checkout_dir);
        }
        rooted
    }

    pub fn clone_command(&self) -> CommandSpec {
        let mut spec = CommandSpec::new("git").arg("clone");
        if let Some(depth) = self.clone_depth {
            spec = spec.arg("--depth").arg(depth.to_string());
        }
        spec.arg(self.repo_url.as_str())
            .arg(self.checkout_dir.to_string_lossy().to_string())
    }

    pub fn init_command(&self) -> CommandSpec {
        CommandSpec::shell(self.init_script.as_str()).current_dir(self.compose_dir())
    }

    /// Clone (unless already checked out) and run the init script.
    ///
    /// Returns the compose directory. Readiness is not awaited here.
    pub async fn bootstrap(&self, runner: &dyn CommandRunner) -> YetiResult<PathBuf> {
        if self.checkout_dir.join(".git").exists() {
            info!(
                "📁 Deployment already checked out at {}, skipping clone",
                self.checkout_dir.display()
            );
        } else {
            info!("📥 Cloning deployment: {}", self.repo_url);
            let clone = self.clone_command();
            runner.run(&clone).await?.check(&clone)?;
        }

        info!("🚀 Running {} in {}", self.init_script, self.compose_dir().display());
        let init = self.init_command();
        runner.run(&init).await?.check(&init)?;

        Ok(self.compose_dir())
    }
}
