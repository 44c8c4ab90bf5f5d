// ABOUTME: Runtime client adding timeouts and the script execution protocol to a container runtime
// ABOUTME: Folds runtime failures into exec outcomes and always cleans up temporary scripts

use crate::protocol::{shell_argv, ScriptPlan};
use crate::runtime::{ContainerRuntime, ExecOutput, RuntimeError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Exit code reported when an execution exceeds its wall-clock budget.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Exit code reported when the runtime itself failed during an execution.
pub const RUNTIME_FAILURE_EXIT_CODE: i64 = -1;

const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one execution. Empty streams are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: i64,
    pub timed_out: bool,
}

impl ExecOutcome {
    fn from_output(output: ExecOutput) -> Self {
        Self {
            stdout: text(output.stdout),
            stderr: text(output.stderr),
            exit_code: output.exit_code,
            timed_out: false,
        }
    }

    fn runtime_failure(context: &str, err: &RuntimeError) -> Self {
        Self {
            stdout: None,
            stderr: Some(format!("{}: {}", context, err)),
            exit_code: RUNTIME_FAILURE_EXIT_CODE,
            timed_out: false,
        }
    }

    fn timed_out(timeout: Duration) -> Self {
        Self {
            stdout: None,
            stderr: Some(format!("Execution timed out after {}s", timeout.as_secs())),
            exit_code: TIMEOUT_EXIT_CODE,
            timed_out: true,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.stderr.is_none()
    }
}

fn text(bytes: Vec<u8>) -> Option<String> {
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[derive(Clone)]
pub struct RuntimeClient {
    runtime: Arc<dyn ContainerRuntime>,
    /// In-container path of the shared mount where scripts are written.
    mount_dir: String,
    exec_timeout: Duration,
}

impl RuntimeClient {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, mount_dir: &str, exec_timeout: Duration) -> Self {
        Self {
            runtime,
            mount_dir: mount_dir.to_string(),
            exec_timeout,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Write `code` to a temporary script, run it with the interpreter matching
    /// `image`, then remove the script whatever happened.
    pub async fn exec_code_in_container(
        &self,
        container_id: &str,
        code: &str,
        image: &str,
    ) -> ExecOutcome {
        let plan = ScriptPlan::new(&self.mount_dir, image, code);
        if plan.interpreter_fallback {
            warn!(
                image,
                "No interpreter matches image, falling back to {}", plan.interpreter.program
            );
        }
        debug!(container_id, path = %plan.path, "Running script");

        let outcome = self.write_and_run(container_id, &plan).await;
        self.cleanup(container_id, &plan).await;
        outcome
    }

    /// Run a literal shell command, without the temporary-file indirection.
    pub async fn exec_command_in_container(&self, container_id: &str, command: &str) -> ExecOutcome {
        match tokio::time::timeout(
            self.exec_timeout,
            self.runtime.exec(container_id, shell_argv(command)),
        )
        .await
        {
            Ok(Ok(output)) => ExecOutcome::from_output(output),
            Ok(Err(e)) => ExecOutcome::runtime_failure("Command failed", &e),
            Err(_) => {
                warn!(container_id, "Command timed out after {:?}", self.exec_timeout);
                ExecOutcome::timed_out(self.exec_timeout)
            }
        }
    }

    async fn write_and_run(&self, container_id: &str, plan: &ScriptPlan) -> ExecOutcome {
        for step in &plan.write_steps {
            match self.runtime.exec(container_id, step.clone()).await {
                Ok(output) if output.exit_code == 0 => {}
                Ok(output) => {
                    let mut outcome = ExecOutcome::from_output(output);
                    let detail = outcome.stderr.take().unwrap_or_default();
                    outcome.stderr = Some(format!("Failed to write script: {}", detail.trim()));
                    return outcome;
                }
                Err(e) => return ExecOutcome::runtime_failure("Failed to write script", &e),
            }
        }

        match tokio::time::timeout(
            self.exec_timeout,
            self.runtime.exec(container_id, plan.run_argv()),
        )
        .await
        {
            Ok(Ok(output)) => ExecOutcome::from_output(output),
            Ok(Err(e)) => ExecOutcome::runtime_failure("Execution failed", &e),
            Err(_) => {
                warn!(container_id, path = %plan.path, "Execution timed out after {:?}", self.exec_timeout);
                self.kill_script(container_id, plan).await;
                ExecOutcome::timed_out(self.exec_timeout)
            }
        }
    }

    async fn kill_script(&self, container_id: &str, plan: &ScriptPlan) {
        let kill = self.runtime.exec(container_id, plan.kill_argv());
        match tokio::time::timeout(HOUSEKEEPING_TIMEOUT, kill).await {
            Ok(Ok(_)) => debug!(container_id, "Killed timed out script"),
            Ok(Err(e)) => warn!(container_id, "Failed to kill timed out script: {}", e),
            Err(_) => warn!(container_id, "Killing timed out script did not finish"),
        }
    }

    /// Best effort; failures are logged and never replace the execution outcome.
    async fn cleanup(&self, container_id: &str, plan: &ScriptPlan) {
        let remove = self.runtime.exec(container_id, plan.cleanup_argv());
        match tokio::time::timeout(HOUSEKEEPING_TIMEOUT, remove).await {
            Ok(Ok(output)) if output.exit_code == 0 => {}
            Ok(Ok(output)) => warn!(
                container_id,
                path = %plan.path,
                exit_code = output.exit_code,
                "Failed to remove temporary script"
            ),
            Ok(Err(e)) => warn!(container_id, path = %plan.path, "Failed to remove temporary script: {}", e),
            Err(_) => warn!(container_id, path = %plan.path, "Removing temporary script timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerState, MockRuntime};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    async fn setup(timeout: Duration) -> (Arc<MockRuntime>, RuntimeClient, String) {
        let runtime = Arc::new(MockRuntime::new());
        let id = runtime
            .insert_container("box", "python:3.10", ContainerState::Running, HashMap::new())
            .await;
        let client = RuntimeClient::new(runtime.clone(), "/share_area", timeout);
        (runtime, client, id)
    }

    #[tokio::test]
    async fn test_successful_execution_leaves_no_script() {
        let (runtime, client, id) = setup(Duration::from_secs(5)).await;

        let outcome = client.exec_code_in_container(&id, "print(1)", "python:3.10").await;
        assert_eq!(outcome.stdout.as_deref(), Some("1\n"));
        assert_eq!(outcome.stderr, None);
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.succeeded());
        assert!(runtime.files().await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_execution_keeps_streams_apart_and_cleans_up() {
        let (runtime, client, id) = setup(Duration::from_secs(5)).await;

        let outcome = client
            .exec_code_in_container(&id, "print('before')\nraise RuntimeError('x')", "python:3.10")
            .await;
        assert_eq!(outcome.stdout.as_deref(), Some("before\n"));
        assert!(outcome.stderr.unwrap().contains("RuntimeError"));
        assert_eq!(outcome.exit_code, 1);
        assert!(runtime.files().await.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_cleans_up() {
        let (runtime, client, id) = setup(Duration::from_millis(50)).await;

        let outcome = client
            .exec_code_in_container(&id, "import time\ntime.sleep(600)", "python:3.10")
            .await;
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        assert!(runtime.files().await.is_empty());

        let log = runtime.exec_log().await;
        assert!(log.iter().any(|argv| argv.len() == 4 && argv[2] == crate::protocol::KILL_SCRIPT));
    }

    #[tokio::test]
    async fn test_runtime_failure_becomes_outcome() {
        let (runtime, client, id) = setup(Duration::from_secs(5)).await;
        runtime.kill(&id).await;

        let outcome = client.exec_code_in_container(&id, "print(1)", "python:3.10").await;
        assert_eq!(outcome.exit_code, RUNTIME_FAILURE_EXIT_CODE);
        assert!(outcome.stderr.unwrap().contains("Failed to write script"));
    }

    #[tokio::test]
    async fn test_node_image_uses_node_interpreter() {
        let (runtime, client, id) = setup(Duration::from_secs(5)).await;

        let outcome = client
            .exec_code_in_container(&id, "process.exit(7)", "node:18")
            .await;
        assert_eq!(outcome.exit_code, 7);

        let log = runtime.exec_log().await;
        let run = log.iter().find(|argv| argv[0] == "node").unwrap();
        assert!(run[1].ends_with(".js"));
    }

    #[tokio::test]
    async fn test_literal_command() {
        let (_runtime, client, id) = setup(Duration::from_secs(5)).await;
        let outcome = client.exec_command_in_container(&id, "echo hello").await;
        assert_eq!(outcome.stdout.as_deref(), Some("hello\n"));
        assert_eq!(outcome.exit_code, 0);
    }
}
