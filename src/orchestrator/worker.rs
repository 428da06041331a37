//! Workers perform the actual work of a unit; the controller only tracks them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::state::WorkUnit;

/// Everything a worker receives for one story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub agent_id: String,
    pub session_id: String,
    pub original_request: String,
    pub project_dir: PathBuf,
    pub unit: WorkUnit,
    /// Advisory topics recommended for the project
    #[serde(default)]
    pub advisories: Vec<String>,
}

/// What a worker reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub success: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    /// Files the worker changed, relative to the project directory
    #[serde(default)]
    pub files_modified: Vec<PathBuf>,
}

impl WorkerOutcome {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result,
            files_modified: Vec::new(),
        }
    }

    pub fn failure(result: serde_json::Value) -> Self {
        Self {
            success: false,
            result,
            files_modified: Vec::new(),
        }
    }
}

/// Executes one assignment.
///
/// Implementations should return promptly once `cancel` fires. An `Err`
/// is treated like an unsuccessful outcome.
#[async_trait]
pub trait Worker: Send + Sync {
    fn kind(&self) -> &str;

    async fn execute(&self, assignment: Assignment, cancel: CancellationToken)
    -> Result<WorkerOutcome>;
}

/// Runs a shell command per assignment.
///
/// The assignment is written as JSON to stdin and exposed through
/// `WAYPOINT_AGENT_ID` / `WAYPOINT_UNIT_ID`. Exit 0 is success. If stdout
/// parses as a `WorkerOutcome` JSON document it is used as is; otherwise the
/// output is wrapped into the result.
pub struct CommandWorker {
    command: String,
}

impl CommandWorker {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Worker for CommandWorker {
    fn kind(&self) -> &str {
        "command"
    }

    async fn execute(
        &self,
        assignment: Assignment,
        cancel: CancellationToken,
    ) -> Result<WorkerOutcome> {
        let input = serde_json::to_string(&assignment)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&assignment.project_dir)
            .env("WAYPOINT_AGENT_ID", &assignment.agent_id)
            .env("WAYPOINT_UNIT_ID", &assignment.unit.id)
            .env("WAYPOINT_SESSION_ID", &assignment.session_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker command: {}", self.command))?;

        // A child that never reads stdin must not block cancellation
        let run = async move {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(input.as_bytes()).await;
            }
            child.wait_with_output().await
        };

        let output = tokio::select! {
            output = run => output.context("Failed to wait for worker")?,
            _ = cancel.cancelled() => {
                anyhow::bail!("Worker for {} cancelled", assignment.unit.id);
            }
        };

        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(agent = %assignment.agent_id, exit_code = code, "worker command finished");

        if let Ok(mut outcome) = serde_json::from_str::<WorkerOutcome>(stdout.trim()) {
            outcome.success = outcome.success && code == 0;
            return Ok(outcome);
        }

        let result = serde_json::json!({
            "exit_code": code,
            "stdout": stdout.trim(),
            "stderr": stderr.trim(),
        });
        Ok(if code == 0 {
            WorkerOutcome::success(result)
        } else {
            WorkerOutcome::failure(result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn assignment(dir: &std::path::Path) -> Assignment {
        Assignment {
            agent_id: "a1".into(),
            session_id: "s".into(),
            original_request: "add login".into(),
            project_dir: dir.to_path_buf(),
            unit: WorkUnit::story("S1", "Login form", &[]),
            advisories: vec![],
        }
    }

    #[tokio::test]
    async fn test_exit_code_maps_to_success() {
        let dir = tempdir().unwrap();
        let ok = CommandWorker::new("echo done")
            .execute(assignment(dir.path()), CancellationToken::new())
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.result["stdout"], "done");

        let failed = CommandWorker::new("echo broken >&2; exit 3")
            .execute(assignment(dir.path()), CancellationToken::new())
            .await
            .unwrap();
        assert!(!failed.success);
        assert_eq!(failed.result["exit_code"], 3);
        assert_eq!(failed.result["stderr"], "broken");
    }

    #[tokio::test]
    async fn test_reads_assignment_and_structured_outcome() {
        let dir = tempdir().unwrap();
        let cmd = r#"grep -q '"id":"S1"' && echo "{\"success\":true,\"result\":{\"unit\":\"$WAYPOINT_UNIT_ID\"},\"files_modified\":[\"src/login.rs\"]}""#;
        let outcome = CommandWorker::new(cmd)
            .execute(assignment(dir.path()), CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result["unit"], "S1");
        assert_eq!(outcome.files_modified, vec![PathBuf::from("src/login.rs")]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = CommandWorker::new("sleep 10")
            .execute(assignment(dir.path()), cancel)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_while_stdin_blocked() {
        let dir = tempdir().unwrap();
        let mut big = assignment(dir.path());
        big.unit.title = "x".repeat(4 * 1024 * 1024);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            CommandWorker::new("sleep 30").execute(big, cancel),
        )
        .await
        .expect("cancellation should not wait for the child to drain stdin");
        assert!(result.is_err());
    }
}
