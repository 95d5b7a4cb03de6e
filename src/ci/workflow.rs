//! Workflows, jobs, and strictly sequential step execution

use crate::ci::runner::{CommandRunner, SystemCommandRunner};
use crate::ci::steps::{JobContext, Step, StepSpec};
use crate::error::{YetiError, YetiResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

/// Platform events a workflow can react to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    PullRequest,
    ReleasePublished,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::PullRequest => write!(f, "pull_request"),
            Trigger::ReleasePublished => write!(f, "release_published"),
        }
    }
}

impl FromStr for Trigger {
    type Err = YetiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pull_request" | "pr" => Ok(Trigger::PullRequest),
            "release" | "release_published" | "release:published" => {
                Ok(Trigger::ReleasePublished)
            }
            other => Err(YetiError::invalid_argument(format!(
                "Unknown event '{}', expected pull_request or release",
                other
            ))),
        }
    }
}

/// One operating-system / runtime combination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixEntry {
    pub os: String,
    pub runtime: String,
}

impl fmt::Display for MatrixEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.runtime)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    /// Not run because an earlier step failed
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Success => write!(f, "success"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub id: Uuid,
    pub job: String,
    pub matrix: Option<MatrixEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
}

impl JobReport {
    pub fn success(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Success)
    }

    /// The step that failed the job, if any
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Where and with what a workflow's jobs are executed
#[derive(Clone)]
pub struct ExecutionEnvironment {
    pub runner: Arc<dyn CommandRunner>,
    pub workdir: PathBuf,
    /// Seed environment for every job (usually the process environment)
    pub base_env: HashMap<String, String>,
}

impl ExecutionEnvironment {
    pub fn new<P: Into<PathBuf>>(workdir: P, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            workdir: workdir.into(),
            base_env: HashMap::new(),
        }
    }

    /// Real processes, seeded with the current process environment
    pub fn from_process<P: Into<PathBuf>>(workdir: P) -> Self {
        let mut env = Self::new(workdir, Arc::new(SystemCommandRunner));
        env.base_env = std::env::vars().collect();
        env
    }
}

pub struct Job {
    pub name: String,
    pub matrix: Vec<MatrixEntry>,
    pub env: HashMap<String, String>,
    pub steps: Vec<Box<dyn Step>>,
}

impl Job {
    /// Run every step in order; the first failure skips the rest
    pub async fn run(&self, ctx: &mut JobContext, matrix: Option<&MatrixEntry>) -> JobReport {
        let started_at = Utc::now();
        let mut records = Vec::with_capacity(self.steps.len());
        let mut failed = false;

        match matrix {
            Some(entry) => info!("▶️ Starting job '{}' [{}]", self.name, entry),
            None => info!("▶️ Starting job '{}'", self.name),
        }

        for step in &self.steps {
            if failed {
                records.push(StepRecord {
                    name: step.name().to_string(),
                    status: StepStatus::Skipped,
                    started_at: None,
                    duration_ms: 0,
                    error: None,
                });
                continue;
            }

            info!("🔧 Step: {}", step.name());
            let step_started = Utc::now();
            let clock = Instant::now();
            let result = step.run(ctx).await;
            let duration_ms = clock.elapsed().as_millis() as u64;

            match result {
                Ok(()) => {
                    info!("✅ Step '{}' succeeded in {}ms", step.name(), duration_ms);
                    records.push(StepRecord {
                        name: step.name().to_string(),
                        status: StepStatus::Success,
                        started_at: Some(step_started),
                        duration_ms,
                        error: None,
                    });
                }
                Err(e) => {
                    error!("❌ Step '{}' failed: {}", step.name(), e);
                    failed = true;
                    records.push(StepRecord {
                        name: step.name().to_string(),
                        status: StepStatus::Failed,
                        started_at: Some(step_started),
                        duration_ms,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        JobReport {
            id: Uuid::new_v4(),
            job: self.name.clone(),
            matrix: matrix.cloned(),
            started_at,
            finished_at: Utc::now(),
            steps: records,
        }
    }
}

#[derive(Debug)]
pub enum WorkflowOutcome {
    /// The event is not one of the workflow's triggers
    Skipped,
    Completed(Vec<JobReport>),
}

impl WorkflowOutcome {
    /// Skipped workflows count as successful
    pub fn success(&self) -> bool {
        match self {
            WorkflowOutcome::Skipped => true,
            WorkflowOutcome::Completed(reports) => reports.iter().all(JobReport::success),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WorkflowFile {
    name: String,
    on: Vec<Trigger>,
    jobs: Vec<JobFile>,
}

#[derive(Debug, Deserialize)]
struct JobFile {
    name: String,
    #[serde(default)]
    matrix: Vec<MatrixEntry>,
    #[serde(default)]
    env: HashMap<String, String>,
    steps: Vec<StepSpec>,
}

pub struct Workflow {
    pub name: String,
    pub on: Vec<Trigger>,
    pub jobs: Vec<Job>,
}

impl Workflow {
    pub fn from_yaml(content: &str) -> YetiResult<Self> {
        let file: WorkflowFile = serde_yaml::from_str(content)?;

        if file.on.is_empty() {
            return Err(YetiError::configuration(format!(
                "workflow '{}' has no triggers",
                file.name
            )));
        }

        let jobs = file
            .jobs
            .into_iter()
            .map(|job| Job {
                name: job.name,
                matrix: job.matrix,
                env: job.env,
                steps: job.steps.into_iter().map(StepSpec::into_step).collect(),
            })
            .collect();

        Ok(Self {
            name: file.name,
            on: file.on,
            jobs,
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> YetiResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            YetiError::configuration(format!(
                "Failed to read workflow {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    pub fn triggered_by(&self, event: Trigger) -> bool {
        self.on.contains(&event)
    }

    /// Run every job (once per matrix entry) if `event` triggers this workflow.
    ///
    /// Jobs never share state: each run gets a fresh context seeded from the
    /// base environment, the job's `env`, and the matrix values.
    pub async fn handle(&self, event: Trigger, exec: &ExecutionEnvironment) -> WorkflowOutcome {
        if !self.triggered_by(event) {
            info!("⏭️ Workflow '{}' not triggered by {}", self.name, event);
            return WorkflowOutcome::Skipped;
        }

        info!("🚀 Workflow '{}' triggered by {}", self.name, event);
        let mut reports = Vec::new();

        for job in &self.jobs {
            let entries: Vec<Option<&MatrixEntry>> = if job.matrix.is_empty() {
                vec![None]
            } else {
                job.matrix.iter().map(Some).collect()
            };

            for entry in entries {
                let mut ctx = JobContext::new(exec.workdir.clone(), exec.runner.clone());
                ctx.env = exec.base_env.clone();
                ctx.env
                    .extend(job.env.iter().map(|(k, v)| (k.clone(), v.clone())));
                if let Some(entry) = entry {
                    ctx.set_env("MATRIX_OS", entry.os.clone());
                    ctx.set_env("MATRIX_RUNTIME", entry.runtime.clone());
                }

                reports.push(job.run(&mut ctx, entry).await);
            }
        }

        WorkflowOutcome::Completed(reports)
    }
}
