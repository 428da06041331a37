//! Built-in quality checks.
//!
//! - `CommandCheck`: runs a shell command; exit 0 passes, anything else fails
//! - `FileExistsCheck`: passes when every listed path exists
//! - `ScriptCheck`: runs a script file; exit 0 passes, exit 2 skips, anything
//!   else fails. A missing script is reported as `skip`.
//!
//! Commands receive the gate context as JSON on stdin and through
//! `WAYPOINT_CHECK` / `WAYPOINT_GATE_PHASE` environment variables.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{GateResult, GateStatus};
use crate::waypoint_config::{CheckConfig, CheckKind};

/// Maximum characters of process output kept in a result message.
const MESSAGE_LIMIT: usize = 500;

/// Context handed to a check invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckContext {
    pub project_dir: PathBuf,
    /// Gate phase being run, if any
    pub gate_phase: Option<String>,
    /// Extra arguments appended to command and script checks
    pub args: Vec<String>,
}

impl CheckContext {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            gate_phase: None,
            args: Vec::new(),
        }
    }

    pub fn with_gate_phase(mut self, phase: &str) -> Self {
        self.gate_phase = Some(phase.to_string());
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}

/// A pluggable quality check. Failures are reported in the result, not as errors.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &CheckContext) -> GateResult;
}

/// Build the check described by a `[checks.<name>]` entry.
pub fn from_config(name: &str, config: &CheckConfig) -> Box<dyn Check> {
    let limit = Duration::from_secs(config.timeout_secs.max(1));
    match config.kind {
        CheckKind::Command => Box::new(CommandCheck {
            name: name.to_string(),
            command: config.command.clone().unwrap_or_default(),
            timeout: limit,
        }),
        CheckKind::FileExists => Box::new(FileExistsCheck {
            name: name.to_string(),
            paths: config.paths.clone(),
        }),
        CheckKind::Script => Box::new(ScriptCheck {
            name: name.to_string(),
            script: config.script.clone().unwrap_or_default(),
            timeout: limit,
        }),
    }
}

pub struct CommandCheck {
    pub name: String,
    pub command: String,
    pub timeout: Duration,
}

#[async_trait]
impl Check for CommandCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &CheckContext) -> GateResult {
        if self.command.trim().is_empty() {
            return GateResult::new(&self.name, GateStatus::Fail, "no command configured");
        }
        let mut line = self.command.clone();
        for arg in &ctx.args {
            line.push(' ');
            line.push_str(arg);
        }
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&line);
        run_process(&self.name, cmd, ctx, self.timeout, false).await
    }
}

pub struct FileExistsCheck {
    pub name: String,
    pub paths: Vec<PathBuf>,
}

#[async_trait]
impl Check for FileExistsCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &CheckContext) -> GateResult {
        if self.paths.is_empty() {
            return GateResult::new(&self.name, GateStatus::Skip, "no paths configured");
        }
        let missing: Vec<String> = self
            .paths
            .iter()
            .filter(|p| !ctx.resolve(p).exists())
            .map(|p| p.display().to_string())
            .collect();
        if missing.is_empty() {
            GateResult::new(
                &self.name,
                GateStatus::Pass,
                &format!("{} path(s) present", self.paths.len()),
            )
        } else {
            GateResult::new(
                &self.name,
                GateStatus::Fail,
                &format!("missing: {}", missing.join(", ")),
            )
        }
    }
}

pub struct ScriptCheck {
    pub name: String,
    pub script: PathBuf,
    pub timeout: Duration,
}

#[async_trait]
impl Check for ScriptCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &CheckContext) -> GateResult {
        let script = ctx.resolve(&self.script);
        if self.script.as_os_str().is_empty() || !script.is_file() {
            return GateResult::new(
                &self.name,
                GateStatus::Skip,
                &format!("script not found: {}", self.script.display()),
            );
        }
        let mut cmd = Command::new("sh");
        cmd.arg(&script).args(&ctx.args);
        run_process(&self.name, cmd, ctx, self.timeout, true).await
    }
}

/// Spawn `cmd` in the project directory, feed the context on stdin and map
/// the exit status to a result.
async fn run_process(
    name: &str,
    mut cmd: Command,
    ctx: &CheckContext,
    limit: Duration,
    exit_two_skips: bool,
) -> GateResult {
    let context_json = serde_json::to_string(ctx).unwrap_or_default();

    cmd.current_dir(&ctx.project_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env("WAYPOINT_CHECK", name)
        .env("WAYPOINT_GATE_PHASE", ctx.gate_phase.as_deref().unwrap_or(""));

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return GateResult::new(name, GateStatus::Fail, &format!("failed to spawn: {e}"));
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        // A check that ignores stdin may close it early; that is not a failure
        let _ = stdin.write_all(context_json.as_bytes()).await;
    }

    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return GateResult::new(name, GateStatus::Fail, &format!("failed to wait: {e}"));
        }
        Err(_) => {
            return GateResult::new(
                name,
                GateStatus::Fail,
                &format!("timed out after {} seconds", limit.as_secs()),
            );
        }
    };

    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(check = name, exit_code = code, "check finished");

    let detail = if !stderr.trim().is_empty() {
        stderr.trim()
    } else {
        stdout.trim()
    };

    match code {
        0 => GateResult::new(name, GateStatus::Pass, &truncate(stdout.trim(), "ok")),
        2 if exit_two_skips => GateResult::new(name, GateStatus::Skip, &truncate(detail, "skipped")),
        _ => GateResult::new(
            name,
            GateStatus::Fail,
            &truncate(detail, &format!("exit code {code}")),
        ),
    }
}

fn truncate(text: &str, fallback: &str) -> String {
    if text.is_empty() {
        return fallback.to_string();
    }
    // Keep the tail; the last lines of a failing tool are the informative ones
    let count = text.chars().count();
    if count <= MESSAGE_LIMIT {
        text.to_string()
    } else {
        let tail: String = text.chars().skip(count - MESSAGE_LIMIT).collect();
        format!("...{tail}")
    }
}
