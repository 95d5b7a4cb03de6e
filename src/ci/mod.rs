//! CI harness: typed workflows that bootstrap a Yeti deployment, provision
//! credentials, run the test suites and publish releases.

pub mod deployment;
pub mod keys;
pub mod readiness;
pub mod runner;
pub mod steps;
pub mod workflow;

// Re-export the types most callers need
pub use deployment::DeploymentBootstrap;
pub use keys::{extract_api_key, provision_admin_key, ApiKey, KeyProvisioning};
pub use readiness::{wait_until_ready, ReadinessPolicy};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, SystemCommandRunner};
pub use steps::{JobContext, Step, StepSpec};
pub use workflow::{
    ExecutionEnvironment, Job, JobReport, MatrixEntry, StepRecord, StepStatus, Trigger, Workflow,
    WorkflowOutcome,
};
