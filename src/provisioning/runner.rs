//! Runs `ansible-playbook` against a generated inventory.

use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::json;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ProvisioningError, ProvisioningFuture, ProvisioningRunner};
use crate::events::JobRef;

const DEFAULT_PROGRAM: &str = "ansible-playbook";

/// Result of running the playbook process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Runs a playbook with the provider's credentials in its environment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnsiblePlaybookRunner {
    program: String,
    playbook: Utf8PathBuf,
    env: HashMap<String, String>,
}

impl AnsiblePlaybookRunner {
    /// Creates a runner for `playbook` using `ansible-playbook` from `PATH`.
    #[must_use]
    pub fn new(playbook: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: String::from(DEFAULT_PROGRAM),
            playbook: playbook.into(),
            env: HashMap::new(),
        }
    }

    /// Overrides the executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Adds environment variables, typically
    /// [`Provider::environment_vars`](crate::provider::Provider::environment_vars).
    #[must_use]
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    fn arguments(&self, job: &JobRef, inventory: &Utf8Path) -> Vec<String> {
        vec![
            String::from("-i"),
            inventory.as_str().to_owned(),
            String::from("--extra-vars"),
            json!({ "job_id": job.id, "job_name": job.name }).to_string(),
            self.playbook.as_str().to_owned(),
        ]
    }
}

/// Runs `program` to completion. Dropping the future kills the child.
async fn execute(
    program: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> Result<CommandOutput, ProvisioningError> {
    let output = Command::new(program)
        .args(args)
        .envs(env)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| ProvisioningError::Runner(format!("failed to spawn {program}: {err}")))?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

impl ProvisioningRunner for AnsiblePlaybookRunner {
    fn run<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        job: &'a JobRef,
        inventory: &'a Utf8Path,
    ) -> ProvisioningFuture<'a, ()> {
        Box::pin(async move {
            let args = self.arguments(job, inventory);
            debug!(job_id = job.id, program = %self.program, inventory = %inventory, "running playbook");

            let output = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    warn!(job_id = job.id, "playbook cancelled");
                    return Err(ProvisioningError::Cancelled);
                }
                output = execute(&self.program, &args, &self.env) => output?,
            };

            if output.is_success() {
                return Ok(());
            }
            warn!(job_id = job.id, code = ?output.code, stderr = %output.stderr, "playbook failed");
            Err(ProvisioningError::Runner(format!(
                "{} exited with {}",
                self.program,
                output
                    .code
                    .map_or_else(|| String::from("a signal"), |code| format!("status {code}"))
            )))
        })
    }
}
